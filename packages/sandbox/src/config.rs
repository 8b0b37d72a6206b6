// ABOUTME: Runtime configuration for sandbox providers
// ABOUTME: Docker and local-directory settings loaded from the environment with safe fallbacks

use agentbox_config::{constants, defaults, env_or, env_string};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the Docker-backed provider
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub network: String,
    /// Docker endpoint (`unix:///...`, `tcp://host:port`); `None` uses the local default socket
    pub host: Option<String>,
    pub preview_base_url: String,
    /// Wildcard domain routed to sandbox ports, e.g. `sandboxes.example.com`
    pub sandbox_domain: Option<String>,
    pub user_home: String,
    pub ide_port: u16,
    pub command_timeout: Duration,
    pub max_checkpoints: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: defaults::DOCKER_IMAGE.to_string(),
            network: defaults::DOCKER_NETWORK.to_string(),
            host: None,
            preview_base_url: defaults::PREVIEW_BASE_URL.to_string(),
            sandbox_domain: None,
            user_home: crate::helpers::SANDBOX_HOME.to_string(),
            ide_port: defaults::IDE_PORT,
            command_timeout: Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
            max_checkpoints: defaults::MAX_CHECKPOINTS_PER_SANDBOX,
        }
    }
}

impl DockerConfig {
    pub fn from_env() -> Self {
        let fallback = Self::default();
        Self {
            image: env_string(constants::AGENTBOX_DOCKER_IMAGE).unwrap_or(fallback.image),
            network: env_string(constants::AGENTBOX_DOCKER_NETWORK).unwrap_or(fallback.network),
            host: env_string(constants::AGENTBOX_DOCKER_HOST)
                .or_else(|| env_string(constants::DOCKER_HOST)),
            preview_base_url: env_string(constants::AGENTBOX_PREVIEW_BASE_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(fallback.preview_base_url),
            sandbox_domain: env_string(constants::AGENTBOX_SANDBOX_DOMAIN),
            user_home: fallback.user_home,
            ide_port: env_or(constants::AGENTBOX_IDE_PORT, defaults::IDE_PORT, |&p| p > 0),
            command_timeout: command_timeout_from_env(),
            max_checkpoints: max_checkpoints_from_env(),
        }
    }
}

/// Settings for the host-directory provider
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Directory holding one subdirectory per sandbox
    pub root: PathBuf,
    pub preview_base_url: String,
    pub command_timeout: Duration,
    pub max_checkpoints: usize,
}

impl LocalConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            preview_base_url: defaults::PREVIEW_BASE_URL.to_string(),
            command_timeout: Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
            max_checkpoints: defaults::MAX_CHECKPOINTS_PER_SANDBOX,
        }
    }

    pub fn from_env() -> Self {
        let root = env_string(constants::AGENTBOX_LOCAL_SANDBOX_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("agentbox-sandboxes"));
        Self {
            root,
            preview_base_url: env_string(constants::AGENTBOX_PREVIEW_BASE_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| defaults::PREVIEW_BASE_URL.to_string()),
            command_timeout: command_timeout_from_env(),
            max_checkpoints: max_checkpoints_from_env(),
        }
    }
}

fn command_timeout_from_env() -> Duration {
    Duration::from_secs(env_or(
        constants::AGENTBOX_COMMAND_TIMEOUT_SECS,
        defaults::COMMAND_TIMEOUT_SECS,
        |&v| (1..=3600).contains(&v),
    ))
}

fn max_checkpoints_from_env() -> usize {
    env_or(
        constants::AGENTBOX_MAX_CHECKPOINTS,
        defaults::MAX_CHECKPOINTS_PER_SANDBOX,
        |&v| (1..=1000).contains(&v),
    )
}
