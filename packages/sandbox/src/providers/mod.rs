// ABOUTME: Provider trait for sandbox backends and shared execution options
// ABOUTME: Defines the full capability set every backend implements: lifecycle, exec, files, PTY, checkpoints, previews

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::transport::{AgentOptions, AgentTransport};
use crate::types::{
    CheckpointInfo, CommandResult, FileContent, FileMetadata, PreviewLink, PtyHandle, PtySize,
    SecretEntry,
};

pub mod docker;
pub mod local;

pub use docker::DockerProvider;
pub use local::LocalProvider;

/// Options for a one-shot command
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Start the command and return immediately without capturing output
    pub background: bool,
    pub env: HashMap<String, String>,
    /// Overrides the provider's default command timeout
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn background() -> Self {
        Self {
            background: true,
            ..Default::default()
        }
    }
}

/// Sandbox backend capability set.
///
/// Shared algorithms (checkpoint chaining, port filtering, path normalization)
/// live in [`crate::helpers`]; backends call into them explicitly.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Short backend name used in logs and errors
    fn name(&self) -> &'static str;

    // ==================== Lifecycle ====================

    /// Provision a fresh sandbox and return its id
    async fn create(&self) -> Result<String>;

    /// Attach to an existing sandbox, starting it if parked. `false` if it does not exist.
    async fn connect(&self, sandbox_id: &str) -> Result<bool>;

    /// Tear down a sandbox. Best-effort: teardown failures are logged, not returned.
    async fn delete(&self, sandbox_id: &str) -> Result<()>;

    async fn is_running(&self, sandbox_id: &str) -> Result<bool>;

    /// Copy `source_id` into a new independent sandbox, optionally restoring a checkpoint into it
    async fn clone_sandbox(&self, source_id: &str, checkpoint_id: Option<&str>) -> Result<String>;

    // ==================== Commands & Files ====================

    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult>;

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent>;

    /// List files under `path` (home when `None`), skipping dependency and build directories
    async fn list_files(&self, sandbox_id: &str, path: Option<&str>) -> Result<Vec<FileMetadata>>;

    // ==================== PTY Sessions ====================

    /// Open an interactive terminal. Output arrives on the returned handle's channel.
    async fn create_pty(&self, sandbox_id: &str, size: PtySize) -> Result<PtyHandle>;

    async fn send_pty_input(&self, sandbox_id: &str, pty_id: &str, data: &[u8]) -> Result<()>;

    async fn resize_pty(&self, sandbox_id: &str, pty_id: &str, size: PtySize) -> Result<()>;

    /// Kill a terminal. Unknown sessions are ignored so teardown paths stay idempotent.
    async fn kill_pty(&self, sandbox_id: &str, pty_id: &str) -> Result<()>;

    // ==================== Checkpoints ====================

    /// Snapshot the home directory under `checkpoint_id`, then prune beyond the retention cap
    async fn create_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<String>;

    /// Mirror a checkpoint back onto the home directory, including deletions
    async fn restore_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<()>;

    /// Checkpoints newest first
    async fn list_checkpoints(&self, sandbox_id: &str) -> Result<Vec<CheckpointInfo>>;

    // ==================== Previews & URLs ====================

    async fn get_preview_links(&self, sandbox_id: &str) -> Result<Vec<PreviewLink>>;

    /// `Ok(None)` when the port is not published yet; `NotSupported` when the backend
    /// runs no IDE or VNC server at all.
    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>>;

    async fn get_vnc_url(&self, sandbox_id: &str) -> Result<Option<String>>;

    // ==================== Secrets ====================

    async fn get_secrets(&self, sandbox_id: &str) -> Result<Vec<SecretEntry>>;

    async fn add_secret(&self, sandbox_id: &str, key: &str, value: &str) -> Result<()>;

    async fn delete_secret(&self, sandbox_id: &str, key: &str) -> Result<()>;

    // ==================== Agent Transport ====================

    /// Build an unconnected transport that runs the agent CLI inside the sandbox
    fn open_transport(
        &self,
        sandbox_id: &str,
        options: AgentOptions,
    ) -> Result<Box<dyn AgentTransport>>;

    /// Release provider-wide resources (open PTY sessions)
    async fn cleanup(&self);
}
