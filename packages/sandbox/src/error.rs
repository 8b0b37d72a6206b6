// ABOUTME: Error types for sandbox providers and the agent CLI transport
// ABOUTME: Distinguishes provisioning, not-found, timeout, unsupported, and protocol failures

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Infrastructure or credential failure while creating or attaching
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    /// Stale sandbox, checkpoint, file, or PTY id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Command exceeded its wall-clock budget
    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Backend lacks the requested capability
    #[error("Operation not supported by {provider}: {operation}")]
    NotSupported {
        provider: &'static str,
        operation: &'static str,
    },

    /// Command ran but reported failure
    #[error("Command failed with exit code {exit_code}: {output}")]
    CommandFailed { exit_code: i64, output: String },

    /// Agent CLI channel could not be opened or broke mid-stream
    #[error("CLI connection error: {0}")]
    CliConnection(String),

    /// Agent CLI emitted malformed or oversized JSON
    #[error("Failed to decode CLI output: {reason} (near: {snippet})")]
    CliDecode { reason: String, snippet: String },

    /// Agent CLI exited abnormally
    #[error("CLI process exited with code {exit_code}: {stderr}")]
    Process { exit_code: i64, stderr: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Docker/container-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Sandbox",
            id: id.into(),
        }
    }

    pub fn checkpoint_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Checkpoint",
            id: id.into(),
        }
    }

    pub fn pty_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "PTY session",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn decode(reason: impl Into<String>, snippet: &str) -> Self {
        let snippet: String = snippet.chars().take(200).collect();
        Self::CliDecode {
            reason: reason.into(),
            snippet,
        }
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
