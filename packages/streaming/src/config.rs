// ABOUTME: Runtime settings for the stream log, markers, queue, and live readers
// ABOUTME: Read from AGENTBOX_* variables with lenient fallback to defaults

use agentbox_config::{constants, defaults, env_or, env_string};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Approximate cap on entries kept per chat log
    pub stream_max_len: usize,
    /// Expiry of the active-task marker
    pub task_ttl: Duration,
    /// Expiry of the revoked flag
    pub revoked_ttl: Duration,
    /// Expiry of an unconsumed queued message
    pub queue_ttl: Duration,
    /// Longest a live reader blocks on one poll
    pub live_poll_interval: Duration,
    /// Agent CLI executable inside the sandbox
    pub cli_path: String,
    pub cli_max_buffer_bytes: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_max_len: defaults::STREAM_MAX_LEN,
            task_ttl: Duration::from_secs(defaults::TASK_TTL_SECS),
            revoked_ttl: Duration::from_secs(defaults::REVOKED_TTL_SECS),
            queue_ttl: Duration::from_secs(defaults::QUEUE_TTL_SECS),
            live_poll_interval: Duration::from_millis(defaults::LIVE_POLL_MS),
            cli_path: defaults::CLI_PATH.to_string(),
            cli_max_buffer_bytes: defaults::CLI_MAX_BUFFER_BYTES,
        }
    }
}

impl StreamingConfig {
    pub fn from_env() -> Self {
        Self {
            stream_max_len: env_or(
                constants::AGENTBOX_STREAM_MAX_LEN,
                defaults::STREAM_MAX_LEN,
                |&n| n > 0,
            ),
            task_ttl: Duration::from_secs(env_or(
                constants::AGENTBOX_TASK_TTL_SECS,
                defaults::TASK_TTL_SECS,
                |&n| n > 0,
            )),
            revoked_ttl: Duration::from_secs(env_or(
                constants::AGENTBOX_REVOKED_TTL_SECS,
                defaults::REVOKED_TTL_SECS,
                |&n| n > 0,
            )),
            queue_ttl: Duration::from_secs(env_or(
                constants::AGENTBOX_QUEUE_TTL_SECS,
                defaults::QUEUE_TTL_SECS,
                |&n| n > 0,
            )),
            live_poll_interval: Duration::from_millis(env_or(
                constants::AGENTBOX_LIVE_POLL_MS,
                defaults::LIVE_POLL_MS,
                |&n| (10..=60_000).contains(&n),
            )),
            cli_path: env_string(constants::AGENTBOX_CLI_PATH)
                .unwrap_or_else(|| defaults::CLI_PATH.to_string()),
            cli_max_buffer_bytes: env_or(
                constants::AGENTBOX_CLI_MAX_BUFFER_BYTES,
                defaults::CLI_MAX_BUFFER_BYTES,
                |&n| n >= 1024,
            ),
        }
    }
}
