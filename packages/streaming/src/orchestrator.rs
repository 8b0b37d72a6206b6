// ABOUTME: Drives one agent turn from first event to persisted terminal state
// ABOUTME: Republishes events, splices queued messages, checkpoints, and hands off continuations

use agentbox_sandbox::SandboxProvider;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::agent::AgentSession;
use crate::cancellation::{stop_monitor, CancellationHandler};
use crate::error::{Result, StreamingError};
use crate::events::StreamEvent;
use crate::injector::QueueInjector;
use crate::messages::{Chat, MessageStore, MessageStreamStatus, NewMessage};
use crate::publisher::{QueueNotice, StreamPublisher};
use crate::queue::QueueService;
use crate::worker::{ChatRequest, ContinuationDispatcher};

/// Mutable state of the turn being streamed
pub struct StreamContext {
    pub chat: Chat,
    /// Row receiving the events; changes when a queued message is injected
    pub assistant_message_id: Option<String>,
    pub events: Vec<StreamEvent>,
}

impl StreamContext {
    pub fn new(chat: Chat, assistant_message_id: Option<String>) -> Self {
        Self {
            chat,
            assistant_message_id,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    /// JSON array of the events persisted for the final message
    pub final_content: String,
    pub total_cost_usd: f64,
    pub event_count: usize,
}

/// How a turn ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(StreamSummary),
    Cancelled(StreamSummary),
}

pub(crate) fn serialize_events(events: &[StreamEvent]) -> String {
    serde_json::to_string(events).unwrap_or_else(|e| {
        warn!("Failed to serialize stream events: {}", e);
        "[]".to_string()
    })
}

pub struct StreamOrchestrator {
    publisher: StreamPublisher,
    cancellation: CancellationHandler,
    messages: Arc<dyn MessageStore>,
    queue: QueueService,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    continuation: Option<Arc<dyn ContinuationDispatcher>>,
}

impl StreamOrchestrator {
    pub fn new(
        publisher: StreamPublisher,
        cancellation: CancellationHandler,
        messages: Arc<dyn MessageStore>,
        queue: QueueService,
    ) -> Self {
        Self {
            publisher,
            cancellation,
            messages,
            queue,
            sandbox: None,
            continuation: None,
        }
    }

    /// Checkpoint the chat's sandbox after each completed turn
    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Start queued follow-ups as fresh runs when a turn completes
    pub fn with_continuation(mut self, dispatcher: Arc<dyn ContinuationDispatcher>) -> Self {
        self.continuation = Some(dispatcher);
        self
    }

    pub fn publisher(&self) -> &StreamPublisher {
        &self.publisher
    }

    pub fn cancellation(&self) -> &CancellationHandler {
        &self.cancellation
    }

    /// Run the turn to a terminal state. Failures are published and persisted
    /// before being returned; cancellation is an outcome, not an error.
    pub async fn process_stream(
        &self,
        ctx: &mut StreamContext,
        agent: &mut AgentSession,
    ) -> Result<TurnOutcome> {
        let outcome = match self.process_stream_events(ctx, agent).await {
            Ok(()) => self.conclude(ctx, agent).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            self.fail_turn(
                ctx.assistant_message_id.as_deref(),
                &ctx.events,
                agent.total_cost_usd(),
                e,
            )
            .await;
        }
        outcome
    }

    async fn conclude(
        &self,
        ctx: &mut StreamContext,
        agent: &mut AgentSession,
    ) -> Result<TurnOutcome> {
        if self.cancellation.was_cancelled() {
            if self.cancellation.cancel_requested() {
                info!("Stream for chat {} cancelled by request", ctx.chat.id);
            } else {
                info!("Stream for chat {} stopped by local shutdown", ctx.chat.id);
            }
            if let Err(e) = agent.cancel().await {
                warn!("Failed to stop agent stream for chat {}: {}", ctx.chat.id, e);
            }
            self.update_status(ctx.assistant_message_id.as_deref(), MessageStreamStatus::Interrupted)
                .await;
            let summary = self
                .finalize(ctx, agent.total_cost_usd(), MessageStreamStatus::Interrupted)
                .await;
            return Ok(TurnOutcome::Cancelled(summary));
        }

        if ctx.events.is_empty() {
            return Err(StreamingError::EmptyStream);
        }

        let summary = self
            .finalize(ctx, agent.total_cost_usd(), MessageStreamStatus::Completed)
            .await;
        Ok(TurnOutcome::Completed(summary))
    }

    async fn process_stream_events(
        &self,
        ctx: &mut StreamContext,
        agent: &mut AgentSession,
    ) -> Result<()> {
        let monitor = self.cancellation.spawn_monitor().await;
        let result = self.pump_events(ctx, agent).await;
        stop_monitor(monitor).await;
        result
    }

    async fn pump_events(&self, ctx: &mut StreamContext, agent: &mut AgentSession) -> Result<()> {
        let injector = QueueInjector::new(&self.queue, self.messages.as_ref(), &self.publisher);
        let token = self.cancellation.token().clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                next = agent.next_event() => next,
            };

            if let Some(session_id) = agent.take_session_update() {
                self.record_session(ctx, &session_id).await;
            }

            let event = match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(event)) => event,
            };

            ctx.events.push(event.clone());
            self.publisher.publish_event(&event).await;

            if QueueInjector::should_try_injection(&event) {
                if let Err(e) = injector.check_and_inject(agent, ctx).await {
                    warn!("Queue injection failed for chat {}: {}", ctx.chat.id, e);
                }
            }
        }
    }

    async fn record_session(&self, ctx: &mut StreamContext, session_id: &str) {
        ctx.chat.session_id = Some(session_id.to_string());
        if let Err(e) = self
            .messages
            .update_chat_session(&ctx.chat.id, session_id)
            .await
        {
            error!("Failed to update session_id for chat {}: {}", ctx.chat.id, e);
        }
        if let Some(message_id) = ctx.assistant_message_id.as_deref() {
            if let Err(e) = self.messages.set_message_session(message_id, session_id).await {
                error!("Failed to update session_id for message {}: {}", message_id, e);
            }
        }
    }

    async fn finalize(
        &self,
        ctx: &mut StreamContext,
        total_cost_usd: f64,
        status: MessageStreamStatus,
    ) -> StreamSummary {
        let final_content = serialize_events(&ctx.events);

        if let Some(message_id) = ctx.assistant_message_id.as_deref() {
            if !ctx.events.is_empty() {
                self.save_content(message_id, &final_content, total_cost_usd, status)
                    .await;
            }
        }

        if status == MessageStreamStatus::Completed {
            self.create_checkpoint_if_needed(ctx).await;
            if !self.process_queue_if_available(ctx).await {
                self.publisher.publish_complete().await;
            }
        } else {
            self.publisher.publish_complete().await;
        }

        StreamSummary {
            final_content,
            total_cost_usd,
            event_count: ctx.events.len(),
        }
    }

    /// Terminal write for a failed turn: error entry, FAILED status, partial content
    pub(crate) async fn fail_turn(
        &self,
        assistant_message_id: Option<&str>,
        events: &[StreamEvent],
        total_cost_usd: f64,
        err: &StreamingError,
    ) {
        error!(
            "Error in stream processing for chat {}: {}",
            self.publisher.chat_id(),
            err
        );
        self.publisher.publish_error(&err.to_string()).await;
        self.update_status(assistant_message_id, MessageStreamStatus::Failed)
            .await;

        if let Some(message_id) = assistant_message_id {
            if !events.is_empty() {
                self.save_content(
                    message_id,
                    &serialize_events(events),
                    total_cost_usd,
                    MessageStreamStatus::Failed,
                )
                .await;
            }
        }
    }

    async fn update_status(&self, message_id: Option<&str>, status: MessageStreamStatus) {
        let Some(message_id) = message_id else {
            return;
        };
        if let Err(e) = self.messages.update_status(message_id, status).await {
            error!("Failed to update message status for {}: {}", message_id, e);
        }
    }

    async fn save_content(
        &self,
        message_id: &str,
        content: &str,
        total_cost_usd: f64,
        status: MessageStreamStatus,
    ) {
        if let Err(e) = self
            .messages
            .save_content(message_id, content, total_cost_usd, status)
            .await
        {
            error!("Failed to save message content for {}: {}", message_id, e);
        }
    }

    async fn create_checkpoint_if_needed(&self, ctx: &StreamContext) {
        let (Some(sandbox), Some(sandbox_id), Some(message_id)) = (
            self.sandbox.as_ref(),
            ctx.chat.sandbox_id.as_deref(),
            ctx.assistant_message_id.as_deref(),
        ) else {
            return;
        };

        match sandbox.create_checkpoint(sandbox_id, message_id).await {
            Ok(checkpoint_id) => {
                if let Err(e) = self.messages.set_checkpoint(message_id, &checkpoint_id).await {
                    warn!("Failed to record checkpoint {}: {}", checkpoint_id, e);
                }
            }
            Err(e) => warn!("Failed to create checkpoint: {}", e),
        }
    }

    /// Hand the chat's queued message to a continuation run. `false` when there
    /// was nothing to hand off, in which case the caller publishes `complete`.
    async fn process_queue_if_available(&self, ctx: &StreamContext) -> bool {
        let Some(dispatcher) = self.continuation.as_ref() else {
            return false;
        };
        match self.start_queued_continuation(ctx, dispatcher.as_ref()).await {
            Ok(processed) => processed,
            Err(e) => {
                error!("Failed to process queued message for chat {}: {}", ctx.chat.id, e);
                false
            }
        }
    }

    async fn start_queued_continuation(
        &self,
        ctx: &StreamContext,
        dispatcher: &dyn ContinuationDispatcher,
    ) -> Result<bool> {
        let Some(queued) = self.queue.pop_next_message(&ctx.chat.id).await? else {
            return Ok(false);
        };

        let user_message = self
            .messages
            .create_message(
                &ctx.chat.id,
                NewMessage::user(queued.content.clone(), queued.attachments.clone()),
            )
            .await?;
        let assistant_message = self
            .messages
            .create_message(
                &ctx.chat.id,
                NewMessage::pending_assistant(queued.model_id.clone()),
            )
            .await?;

        self.publisher
            .publish_queue_event(&QueueNotice {
                queued_message_id: queued.id.clone(),
                user_message_id: user_message.id.clone(),
                assistant_message_id: assistant_message.id.clone(),
                content: queued.content.clone(),
                model_id: queued.model_id.clone(),
                attachments: user_message.attachments.clone(),
                injected_inline: false,
            })
            .await;

        let request = ChatRequest {
            chat_id: ctx.chat.id.clone(),
            prompt: queued.content.clone(),
            model_id: queued.model_id.clone(),
            permission_mode: queued.permission_mode.clone(),
            thinking_mode: queued.thinking_mode.clone(),
            attachments: queued.attachments.clone(),
            assistant_message_id: Some(assistant_message.id.clone()),
            session_id: ctx.chat.session_id.clone(),
            system_prompt: None,
            is_queue_continuation: true,
        };

        if let Err(e) = dispatcher.dispatch_continuation(request).await {
            self.update_status(Some(&assistant_message.id), MessageStreamStatus::Failed)
                .await;
            return Err(e);
        }

        info!(
            "Queued message {} for chat {} has been processed",
            queued.id, ctx.chat.id
        );
        Ok(true)
    }
}
