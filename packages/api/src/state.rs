// ABOUTME: Shared application state handed to every route
// ABOUTME: Everything is derived from the chat worker's dependencies so handlers and runs agree

use agentbox_sandbox::SandboxProvider;
use agentbox_streaming::{
    ChatWorker, MessageStore, QueueService, StreamReader, StreamStore, StreamingConfig,
};
use std::sync::Arc;

use crate::sse::SseConnectionTracker;

/// Owner recorded on chats until authentication exists
pub const DEFAULT_USER_ID: &str = "default-user";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StreamStore>,
    pub messages: Arc<dyn MessageStore>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub worker: Arc<ChatWorker>,
    pub queue: QueueService,
    pub reader: StreamReader,
    pub config: StreamingConfig,
    pub sse_tracker: SseConnectionTracker,
}

impl AppState {
    pub fn new(worker: Arc<ChatWorker>) -> Self {
        Self::with_sse_tracker(worker, SseConnectionTracker::new())
    }

    pub fn with_sse_tracker(worker: Arc<ChatWorker>, sse_tracker: SseConnectionTracker) -> Self {
        let deps = worker.deps().clone();
        Self {
            queue: QueueService::new(deps.store.clone(), deps.config.queue_ttl),
            reader: StreamReader::new(deps.store.clone(), deps.config.live_poll_interval),
            store: deps.store,
            messages: deps.messages,
            sandbox: deps.sandbox,
            config: deps.config,
            worker,
            sse_tracker,
        }
    }
}
