// ABOUTME: Background execution of chat turns, one task per chat at a time
// ABOUTME: Claims the active-task marker, wires publisher, cancellation, and agent, then runs the orchestrator

use agentbox_sandbox::{AgentOptions, SandboxError, SandboxProvider, SystemPrompt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{cli_permission_mode, format_user_prompt, thinking_tokens, AgentSession};
use crate::cancellation::CancellationHandler;
use crate::config::StreamingConfig;
use crate::error::{Result, StreamingError};
use crate::keys;
use crate::messages::{Chat, MessageStore};
use crate::orchestrator::{StreamContext, StreamOrchestrator, TurnOutcome};
use crate::publisher::StreamPublisher;
use crate::queue::{QueueService, DEFAULT_PERMISSION_MODE};
use crate::status::TaskLiveness;
use crate::store::StreamStore;

/// Everything needed to run one agent turn for a chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub chat_id: String,
    pub prompt: String,
    pub model_id: String,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
    #[serde(default)]
    pub assistant_message_id: Option<String>,
    /// Agent session to resume; falls back to the chat's stored session
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Set when this run continues a queue hand-off from the previous run
    #[serde(default)]
    pub is_queue_continuation: bool,
}

fn default_permission_mode() -> String {
    DEFAULT_PERMISSION_MODE.to_string()
}

/// Starts the follow-up run for a message that was queued during a turn
#[async_trait]
pub trait ContinuationDispatcher: Send + Sync {
    async fn dispatch_continuation(&self, request: ChatRequest) -> Result<String>;
}

/// Shared dependencies of every run
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn StreamStore>,
    pub messages: Arc<dyn MessageStore>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub config: StreamingConfig,
}

struct RunningChat {
    task_id: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ChatWorker {
    deps: WorkerDeps,
    running: Mutex<HashMap<String, RunningChat>>,
    shutdown: CancellationToken,
    me: Weak<ChatWorker>,
}

impl ChatWorker {
    pub fn new(deps: WorkerDeps) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            deps,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    /// Claim the chat's active-task marker and start the run in the background.
    /// Returns the task id; fails with `AlreadyActive` when a run holds the marker.
    pub async fn dispatch(&self, request: ChatRequest) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let task_key = keys::task_key(&request.chat_id);
        let ttl = self.deps.config.task_ttl;

        if request.is_queue_continuation {
            // The finishing run still holds the marker and hands it over
            self.deps.store.set_with_ttl(&task_key, &task_id, ttl).await?;
        } else {
            let current = self.deps.store.get_versioned(&task_key).await?;
            if current.value.is_some() {
                return Err(StreamingError::AlreadyActive(request.chat_id));
            }
            // A revoked flag left by an earlier turn must not cancel this one
            self.deps
                .store
                .delete(&keys::revoked_key(&request.chat_id))
                .await?;
            if !self
                .deps
                .store
                .compare_and_set(&task_key, current.version, &task_id, ttl)
                .await?
            {
                return Err(StreamingError::AlreadyActive(request.chat_id));
            }
        }

        // Registered right after the claim so liveness checks see the run
        self.spawn_run(task_id.clone(), request);
        Ok(task_id)
    }

    fn spawn_run(&self, task_id: String, request: ChatRequest) {
        let chat_id = request.chat_id.clone();
        let token = self.shutdown.child_token();
        let deps = self.deps.clone();
        let me = self.me.clone();
        let run_token = token.clone();
        let run_task_id = task_id.clone();

        // Held across spawn so the run cannot deregister before it is registered
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            let continuation = me
                .upgrade()
                .map(|worker| worker as Arc<dyn ContinuationDispatcher>);
            let chat_id = request.chat_id.clone();

            match run_chat_stream(&deps, request, &run_task_id, run_token, continuation).await {
                Ok(TurnOutcome::Completed(summary)) => info!(
                    "Chat {} turn {} completed with {} events",
                    chat_id, run_task_id, summary.event_count
                ),
                Ok(TurnOutcome::Cancelled(_)) => {
                    info!("Chat {} turn {} was cancelled", chat_id, run_task_id)
                }
                Err(e) => error!("Chat {} turn {} failed: {}", chat_id, run_task_id, e),
            }

            if let Some(worker) = me.upgrade() {
                worker.finish(&chat_id, &run_task_id);
            }
        });

        running.insert(
            chat_id,
            RunningChat {
                task_id,
                token,
                handle,
            },
        );
    }

    fn finish(&self, chat_id: &str, task_id: &str) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running
            .get(chat_id)
            .is_some_and(|entry| entry.task_id == task_id)
        {
            running.remove(chat_id);
        }
    }

    pub fn running_task(&self, chat_id: &str) -> Option<String> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.get(chat_id).map(|entry| entry.task_id.clone())
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.running_task(chat_id).is_some()
    }

    /// Wait until no run is registered for the chat, including continuations
    pub async fn wait_idle(&self, chat_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_running(chat_id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Cancel every run and wait for them to write their terminal state
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running
                .drain()
                .map(|(chat_id, entry)| {
                    entry.token.cancel();
                    (chat_id, entry.handle)
                })
                .collect()
        };

        for (chat_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!("Run for chat {} ended abnormally: {}", chat_id, e);
            }
        }
        info!("Chat worker stopped");
    }
}

#[async_trait]
impl ContinuationDispatcher for ChatWorker {
    async fn dispatch_continuation(&self, request: ChatRequest) -> Result<String> {
        self.dispatch(request).await
    }
}

impl TaskLiveness for ChatWorker {
    fn is_task_alive(&self, chat_id: &str, task_id: &str) -> bool {
        self.running_task(chat_id).as_deref() == Some(task_id)
    }
}

/// Agent CLI options for one run
pub fn build_agent_options(
    config: &StreamingConfig,
    request: &ChatRequest,
    chat: &Chat,
) -> AgentOptions {
    AgentOptions {
        cli_path: Some(config.cli_path.clone()),
        model: Some(request.model_id.clone()),
        permission_mode: cli_permission_mode(&request.permission_mode).map(str::to_string),
        resume: request
            .session_id
            .clone()
            .or_else(|| chat.session_id.clone()),
        max_thinking_tokens: request.thinking_mode.as_deref().and_then(thinking_tokens),
        system_prompt: request.system_prompt.clone().map(SystemPrompt::Text),
        max_buffer_size: Some(config.cli_max_buffer_bytes),
        ..Default::default()
    }
}

/// Run one turn end to end. The caller must already hold the task marker.
pub async fn run_chat_stream(
    deps: &WorkerDeps,
    request: ChatRequest,
    task_id: &str,
    token: CancellationToken,
    continuation: Option<Arc<dyn ContinuationDispatcher>>,
) -> Result<TurnOutcome> {
    let chat_id = request.chat_id.clone();
    let mut publisher = StreamPublisher::new(
        chat_id.clone(),
        deps.store.clone(),
        deps.config.stream_max_len,
        deps.config.task_ttl,
    );
    publisher.connect(task_id, request.is_queue_continuation).await;

    let mut orchestrator = StreamOrchestrator::new(
        publisher,
        CancellationHandler::new(chat_id.clone(), deps.store.clone(), token),
        deps.messages.clone(),
        QueueService::new(deps.store.clone(), deps.config.queue_ttl),
    )
    .with_sandbox(deps.sandbox.clone());
    if let Some(dispatcher) = continuation {
        orchestrator = orchestrator.with_continuation(dispatcher);
    }

    let result = drive_turn(deps, &orchestrator, &request).await;
    orchestrator.publisher().cleanup().await;
    result
}

async fn drive_turn(
    deps: &WorkerDeps,
    orchestrator: &StreamOrchestrator,
    request: &ChatRequest,
) -> Result<TurnOutcome> {
    let assistant_message_id = request.assistant_message_id.as_deref();

    let (chat, mut session) = match open_session(deps, request).await {
        Ok(opened) => opened,
        Err(e) => {
            orchestrator
                .fail_turn(assistant_message_id, &[], 0.0, &e)
                .await;
            return Err(e);
        }
    };

    let mut ctx = StreamContext::new(chat, request.assistant_message_id.clone());
    let outcome = orchestrator.process_stream(&mut ctx, &mut session).await;

    if let Err(e) = session.close().await {
        warn!("Failed to close agent session for chat {}: {}", ctx.chat.id, e);
    }
    outcome
}

async fn open_session(deps: &WorkerDeps, request: &ChatRequest) -> Result<(Chat, AgentSession)> {
    let chat = deps
        .messages
        .get_chat(&request.chat_id)
        .await?
        .ok_or_else(|| StreamingError::chat_not_found(&request.chat_id))?;

    let sandbox_id = chat
        .sandbox_id
        .clone()
        .ok_or_else(|| StreamingError::Agent(format!("Chat {} has no sandbox", chat.id)))?;
    if !deps.sandbox.connect(&sandbox_id).await? {
        return Err(SandboxError::sandbox_not_found(&sandbox_id).into());
    }

    let options = build_agent_options(&deps.config, request, &chat);
    let transport = deps.sandbox.open_transport(&sandbox_id, options)?;
    let prompt = format_user_prompt(&request.prompt, request.attachments.as_deref());
    let session = AgentSession::start(transport, &prompt, None).await?;
    Ok((chat, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chat(session_id: Option<&str>) -> Chat {
        Chat {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            title: "t".to_string(),
            sandbox_id: Some("sb".to_string()),
            session_id: session_id.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request() -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "chat_id": "c1",
            "prompt": "hi",
            "model_id": "sonnet"
        }))
        .unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let request = request();
        assert_eq!(request.permission_mode, "auto");
        assert!(!request.is_queue_continuation);
        assert!(request.assistant_message_id.is_none());
    }

    #[test]
    fn test_agent_options_resume_falls_back_to_chat_session() {
        let config = StreamingConfig::default();
        let options = build_agent_options(&config, &request(), &chat(Some("s-chat")));
        assert_eq!(options.resume.as_deref(), Some("s-chat"));
        assert_eq!(options.permission_mode.as_deref(), Some("bypassPermissions"));
        assert_eq!(options.model.as_deref(), Some("sonnet"));

        let mut explicit = request();
        explicit.session_id = Some("s-req".to_string());
        explicit.thinking_mode = Some("high".to_string());
        let options = build_agent_options(&config, &explicit, &chat(Some("s-chat")));
        assert_eq!(options.resume.as_deref(), Some("s-req"));
        assert_eq!(options.max_thinking_tokens, Some(16000));
    }
}
