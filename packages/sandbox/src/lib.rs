// ABOUTME: Sandbox providers and the agent CLI transport for Agentbox
// ABOUTME: Exposes the provider trait, Docker and local backends, helpers, and provider selection

pub mod config;
pub mod error;
pub mod helpers;
pub mod providers;
pub mod pty;
pub mod transport;
pub mod types;

pub use config::{DockerConfig, LocalConfig};
pub use error::{Result, SandboxError};
pub use providers::{DockerProvider, ExecOptions, LocalProvider, SandboxProvider};
pub use transport::{AgentDefinition, AgentOptions, AgentTransport, MessageStream, SystemPrompt};
pub use types::{
    CheckpointInfo, CommandResult, FileContent, FileKind, FileMetadata, PreviewLink, PtyEvent,
    PtyHandle, PtySession, PtySize, SecretEntry,
};

use agentbox_config::{constants, env_string};
use std::str::FromStr;
use std::sync::Arc;

/// Which backend serves sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,
    Local,
}

impl FromStr for ProviderKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(SandboxError::InvalidConfiguration(format!(
                "Unknown sandbox provider: {}",
                other
            ))),
        }
    }
}

impl ProviderKind {
    /// Provider named by `AGENTBOX_SANDBOX_PROVIDER`, Docker when unset
    pub fn from_env() -> Result<Self> {
        env_string(constants::AGENTBOX_SANDBOX_PROVIDER)
            .map(|value| value.parse())
            .unwrap_or(Ok(Self::Docker))
    }
}

/// Build the configured provider with settings read from the environment
pub fn provider_from_env(kind: ProviderKind) -> Result<Arc<dyn SandboxProvider>> {
    let provider: Arc<dyn SandboxProvider> = match kind {
        ProviderKind::Docker => Arc::new(DockerProvider::new(DockerConfig::from_env())?),
        ProviderKind::Local => Arc::new(LocalProvider::new(LocalConfig::from_env())),
    };
    tracing::info!("Using {} sandbox provider", provider.name());
    Ok(provider)
}
