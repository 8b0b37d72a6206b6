// ABOUTME: Shared algorithms that sandbox backends compose in explicitly
// ABOUTME: Path normalization, shell quoting, timeout guards, plus file, port, secret, and checkpoint helpers

pub mod checkpoints;
pub mod files;
pub mod ports;
pub mod secrets;

use agentbox_config::defaults;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Home directory of the sandbox user; relative paths resolve against it.
pub const SANDBOX_HOME: &str = "/home/user";

/// Checkpoint store, relative to the sandbox home.
pub const CHECKPOINT_DIR_NAME: &str = ".checkpoints";

/// Buffered PTY output chunks per session before the reader applies backpressure.
pub const PTY_OUTPUT_QUEUE_SIZE: usize = 512;

pub const TERMINAL_TYPE: &str = "xterm-256color";

/// Resolve `path` inside `base`. Absolute paths already under `base` are kept,
/// other absolute paths are re-rooted under `base`, relative paths are joined.
/// `..` components cannot climb above `base`.
pub fn normalize_path(path: &str, base: &str) -> String {
    let base_path = Path::new(base);
    let candidate = Path::new(path);

    let relative: PathBuf = if let Ok(stripped) = candidate.strip_prefix(base_path) {
        stripped.to_path_buf()
    } else if candidate.is_absolute() {
        candidate.components().skip(1).collect()
    } else {
        candidate.to_path_buf()
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }

    let trimmed = base.trim_end_matches('/');
    if parts.is_empty() {
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        format!("{}/{}", trimmed, parts.join("/"))
    }
}

/// Strip the sandbox home prefix, yielding a home-relative path.
pub fn relative_to_home<'a>(path: &'a str, home: &str) -> &'a str {
    path.strip_prefix(home)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

/// Quote a single shell word.
pub fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| SandboxError::InvalidConfiguration(format!("Cannot quote {:?}: {}", word, e)))
}

/// Outer wait guard around a provider call that already enforces `timeout` itself.
///
/// The guard waits a little longer than the provider's own budget so the
/// provider's typed timeout wins the race; if the guard fires anyway, the
/// elapsed budget still surfaces as [`SandboxError::Timeout`].
pub async fn execute_with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guard = timeout + Duration::from_secs(defaults::COMMAND_TIMEOUT_GRACE_SECS);
    match tokio::time::timeout(guard, operation).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}

/// Validate an identifier used as a directory or container-name component.
pub fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && id != "."
        && id != "..";
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfiguration(format!(
            "Invalid {} id: {:?}",
            kind, id
        )))
    }
}

/// New 12-character sandbox id
pub fn new_sandbox_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_variants() {
        assert_eq!(normalize_path("src/main.rs", SANDBOX_HOME), "/home/user/src/main.rs");
        assert_eq!(normalize_path("/home/user/a/b", SANDBOX_HOME), "/home/user/a/b");
        assert_eq!(normalize_path("/etc/passwd", SANDBOX_HOME), "/home/user/etc/passwd");
        assert_eq!(normalize_path("a/./b/../c", SANDBOX_HOME), "/home/user/a/c");
        assert_eq!(normalize_path("../../etc", SANDBOX_HOME), "/home/user/etc");
        assert_eq!(normalize_path("", SANDBOX_HOME), "/home/user");
    }

    #[test]
    fn test_relative_to_home() {
        assert_eq!(relative_to_home("/home/user/app/x.ts", SANDBOX_HOME), "app/x.ts");
        assert_eq!(relative_to_home("/home/user", SANDBOX_HOME), "");
        assert_eq!(relative_to_home("/tmp/x", SANDBOX_HOME), "/tmp/x");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain").unwrap(), "plain");
        assert_eq!(quote("two words").unwrap(), "'two words'");
        assert!(quote("nul\0byte").is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("checkpoint", "msg-123_abc").is_ok());
        assert!(validate_id("checkpoint", "../etc").is_err());
        assert!(validate_id("checkpoint", "").is_err());
        assert!(validate_id("checkpoint", "a/b").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_timeout_converts_elapsed_guard() {
        let result: Result<()> = execute_with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SandboxError::Timeout { seconds: 1 })));
    }

    #[tokio::test]
    async fn test_execute_with_timeout_passes_through() {
        let value = execute_with_timeout(Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
