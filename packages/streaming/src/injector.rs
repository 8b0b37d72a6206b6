// ABOUTME: Splices a queued follow-up message into a running agent turn
// ABOUTME: Only after top-level tool completions, so nested tool protocols are never interrupted

use tracing::{info, warn};

use crate::agent::{format_user_prompt, AgentSession};
use crate::error::Result;
use crate::events::StreamEvent;
use crate::messages::{MessageStore, MessageStreamStatus, NewMessage};
use crate::orchestrator::{serialize_events, StreamContext};
use crate::publisher::{QueueNotice, StreamPublisher};
use crate::queue::QueueService;

pub struct QueueInjector<'a> {
    queue: &'a QueueService,
    messages: &'a dyn MessageStore,
    publisher: &'a StreamPublisher,
}

impl<'a> QueueInjector<'a> {
    pub fn new(
        queue: &'a QueueService,
        messages: &'a dyn MessageStore,
        publisher: &'a StreamPublisher,
    ) -> Self {
        Self {
            queue,
            messages,
            publisher,
        }
    }

    pub fn should_try_injection(event: &StreamEvent) -> bool {
        event.is_top_level_tool_completion()
    }

    /// Inject the chat's queued message, if any. On success the context has moved
    /// on to the new assistant message, whose id is returned.
    pub async fn check_and_inject(
        &self,
        agent: &mut AgentSession,
        ctx: &mut StreamContext,
    ) -> Result<Option<String>> {
        let chat_id = ctx.chat.id.clone();
        let Some(queued) = self.queue.pop_next_message(&chat_id).await? else {
            return Ok(None);
        };

        let user_message = self
            .messages
            .create_message(
                &chat_id,
                NewMessage::user(queued.content.clone(), queued.attachments.clone()),
            )
            .await?;
        let assistant_message = self
            .messages
            .create_message(&chat_id, NewMessage::pending_assistant(queued.model_id.clone()))
            .await?;

        // The turn so far is finished from the client's point of view
        if let Some(previous) = ctx.assistant_message_id.as_deref() {
            if !ctx.events.is_empty() {
                if let Err(e) = self
                    .messages
                    .save_content(
                        previous,
                        &serialize_events(&ctx.events),
                        agent.total_cost_usd(),
                        MessageStreamStatus::Completed,
                    )
                    .await
                {
                    warn!("Failed to save message {} before injection: {}", previous, e);
                }
            }
        }
        self.publisher.clear_stream().await;
        ctx.assistant_message_id = Some(assistant_message.id.clone());
        ctx.events.clear();

        self.publisher
            .publish_queue_event(&QueueNotice {
                queued_message_id: queued.id.clone(),
                user_message_id: user_message.id.clone(),
                assistant_message_id: assistant_message.id.clone(),
                content: queued.content.clone(),
                model_id: queued.model_id.clone(),
                attachments: user_message.attachments.clone(),
                injected_inline: true,
            })
            .await;

        let prompt = format_user_prompt(&queued.content, queued.attachments.as_deref());
        agent.send_user_message(&prompt).await?;

        info!(
            "Injected queued message {} into chat {} as {}",
            queued.id, chat_id, assistant_message.id
        );
        Ok(Some(assistant_message.id))
    }
}
