// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Agentbox

// Server Configuration
pub const AGENTBOX_API_PORT: &str = "AGENTBOX_API_PORT";
pub const AGENTBOX_API_HOST: &str = "AGENTBOX_API_HOST";
pub const AGENTBOX_CORS_ORIGIN: &str = "AGENTBOX_CORS_ORIGIN";
pub const AGENTBOX_DATABASE_URL: &str = "AGENTBOX_DATABASE_URL";

// Sandbox Provider Selection
pub const AGENTBOX_SANDBOX_PROVIDER: &str = "AGENTBOX_SANDBOX_PROVIDER";

// Docker Provider
pub const AGENTBOX_DOCKER_IMAGE: &str = "AGENTBOX_DOCKER_IMAGE";
pub const AGENTBOX_DOCKER_NETWORK: &str = "AGENTBOX_DOCKER_NETWORK";
pub const AGENTBOX_DOCKER_HOST: &str = "AGENTBOX_DOCKER_HOST";
pub const DOCKER_HOST: &str = "DOCKER_HOST"; // Docker's own variable
pub const AGENTBOX_PREVIEW_BASE_URL: &str = "AGENTBOX_PREVIEW_BASE_URL";
pub const AGENTBOX_SANDBOX_DOMAIN: &str = "AGENTBOX_SANDBOX_DOMAIN";
pub const AGENTBOX_IDE_PORT: &str = "AGENTBOX_IDE_PORT";

// Local Provider
pub const AGENTBOX_LOCAL_SANDBOX_ROOT: &str = "AGENTBOX_LOCAL_SANDBOX_ROOT";

// Sandbox Operations
pub const AGENTBOX_COMMAND_TIMEOUT_SECS: &str = "AGENTBOX_COMMAND_TIMEOUT_SECS";
pub const AGENTBOX_MAX_CHECKPOINTS: &str = "AGENTBOX_MAX_CHECKPOINTS";

// Agent CLI
pub const AGENTBOX_CLI_PATH: &str = "AGENTBOX_CLI_PATH";
pub const AGENTBOX_CLI_MAX_BUFFER_BYTES: &str = "AGENTBOX_CLI_MAX_BUFFER_BYTES";

// Streaming
pub const AGENTBOX_STREAM_MAX_LEN: &str = "AGENTBOX_STREAM_MAX_LEN";
pub const AGENTBOX_TASK_TTL_SECS: &str = "AGENTBOX_TASK_TTL_SECS";
pub const AGENTBOX_REVOKED_TTL_SECS: &str = "AGENTBOX_REVOKED_TTL_SECS";
pub const AGENTBOX_QUEUE_TTL_SECS: &str = "AGENTBOX_QUEUE_TTL_SECS";
pub const AGENTBOX_LIVE_POLL_MS: &str = "AGENTBOX_LIVE_POLL_MS";

// SSE Stream Configuration
pub const AGENTBOX_SSE_MAX_CONNECTIONS_PER_IP: &str = "AGENTBOX_SSE_MAX_CONNECTIONS_PER_IP";

// System Environment Variables
pub const HOME: &str = "HOME";
pub const RUST_LOG: &str = "RUST_LOG";
