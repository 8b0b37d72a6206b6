// ABOUTME: Error types for stream orchestration, the durable store, and message persistence
// ABOUTME: Cancellation is deliberately absent; it is an outcome, not a failure

use agentbox_sandbox::SandboxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamingError {
    /// Stream store backend failure
    #[error("Stream store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Agent CLI reported a failed turn
    #[error("Agent error: {0}")]
    Agent(String),

    /// Agent stream closed without producing a single event
    #[error("Stream completed without any events")]
    EmptyStream,

    /// Queued message kept changing under us
    #[error("Queued message for chat {chat_id} changed concurrently {attempts} times")]
    QueueConflict { chat_id: String, attempts: u32 },

    /// A stream is already running for this chat
    #[error("A stream is already active for chat {0}")]
    AlreadyActive(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamingError {
    pub fn chat_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Chat",
            id: id.into(),
        }
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Message",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Sandbox(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamingError>;
