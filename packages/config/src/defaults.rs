// ABOUTME: Default values for Agentbox configuration
// ABOUTME: Used when the corresponding environment variable is unset or invalid

pub const API_PORT: u16 = 4001;
pub const API_HOST: &str = "127.0.0.1";
pub const CORS_ORIGIN: &str = "http://localhost:5173";
pub const DATABASE_URL: &str = "sqlite://agentbox.db?mode=rwc";

pub const DOCKER_IMAGE: &str = "ghcr.io/agentbox/agentbox-sandbox:latest";
pub const DOCKER_NETWORK: &str = "agentbox-sandbox-net";
pub const PREVIEW_BASE_URL: &str = "http://localhost";
pub const IDE_PORT: u16 = 8765;

/// Wall-clock budget for one-shot sandbox commands.
pub const COMMAND_TIMEOUT_SECS: u64 = 120;
/// Grace added on top of a command timeout for the outer wait guard.
pub const COMMAND_TIMEOUT_GRACE_SECS: u64 = 5;
pub const MAX_CHECKPOINTS_PER_SANDBOX: usize = 20;

pub const CLI_PATH: &str = "claude";
pub const CLI_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

pub const STREAM_MAX_LEN: usize = 10_000;
pub const TASK_TTL_SECS: u64 = 3600;
pub const REVOKED_TTL_SECS: u64 = 3600;
pub const QUEUE_TTL_SECS: u64 = 3600;
pub const LIVE_POLL_MS: u64 = 1000;

pub const SSE_MAX_CONNECTIONS_PER_IP: usize = 3;
