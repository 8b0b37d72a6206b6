// ABOUTME: Secret management helpers backed by export lines in the sandbox shell profile
// ABOUTME: Formats, parses, and removes `export KEY='value'` entries while hiding system variables

use std::time::Duration;

use super::quote;
use crate::error::{Result, SandboxError};
use crate::providers::{ExecOptions, SandboxProvider};
use crate::types::SecretEntry;

const SECRET_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub const BASHRC_PATH: &str = "~/.bashrc";

/// Variables the shell or image manages; never reported as secrets.
pub const SYSTEM_VARIABLES: &[&str] = &[
    "SHELL",
    "PWD",
    "LOGNAME",
    "HOME",
    "USER",
    "SHLVL",
    "PS1",
    "PATH",
    "_",
    "NVM_DIR",
    "NODE_VERSION",
    "TERM",
];

pub const LIST_EXPORTS_COMMAND: &str = "grep '^export' ~/.bashrc | sed 's/^export //g'";

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfiguration(format!(
            "Invalid secret name: {:?}",
            key
        )))
    }
}

/// `export KEY='value'` with single quotes inside the value escaped.
pub fn format_export_command(key: &str, value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("export {}='{}'", key, escaped)
}

/// Command appending an export line to the profile
pub fn add_secret_command(key: &str, value: &str) -> Result<String> {
    validate_key(key)?;
    Ok(format!(
        "echo {} >> {}",
        quote(&format_export_command(key, value))?,
        BASHRC_PATH
    ))
}

/// Command deleting every export line for `key`
pub fn delete_secret_command(key: &str) -> Result<String> {
    validate_key(key)?;
    Ok(format!("sed -i '/^export {}=/d' {}", key, BASHRC_PATH))
}

/// Parse `KEY=value` lines (export prefix already stripped), dropping system variables.
pub fn parse_exports(stdout: &str) -> Vec<SecretEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || SYSTEM_VARIABLES.contains(&key) {
                return None;
            }
            Some(SecretEntry {
                key: key.to_string(),
                value: unquote(value.trim()),
            })
        })
        .collect()
}

fn unquote(value: &str) -> String {
    let unescaped = value.replace("'\"'\"'", "'");
    unescaped
        .trim_matches('"')
        .trim_matches('\'')
        .to_string()
}

// ==================== Provider Composition ====================

async fn run_checked<P>(provider: &P, sandbox_id: &str, command: &str) -> Result<String>
where
    P: SandboxProvider + ?Sized,
{
    let result = provider
        .execute(sandbox_id, command, ExecOptions::with_timeout(SECRET_COMMAND_TIMEOUT))
        .await?;
    if !result.success() {
        return Err(SandboxError::CommandFailed {
            exit_code: result.exit_code,
            output: format!("{}{}", result.stdout, result.stderr),
        });
    }
    Ok(result.stdout)
}

/// Exported variables from the profile, minus system ones
pub async fn list_secrets<P>(provider: &P, sandbox_id: &str) -> Result<Vec<SecretEntry>>
where
    P: SandboxProvider + ?Sized,
{
    // grep exits 1 when the profile has no exports
    let result = provider
        .execute(
            sandbox_id,
            LIST_EXPORTS_COMMAND,
            ExecOptions::with_timeout(SECRET_COMMAND_TIMEOUT),
        )
        .await?;
    Ok(parse_exports(&result.stdout))
}

pub async fn append_secret<P>(provider: &P, sandbox_id: &str, key: &str, value: &str) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    run_checked(provider, sandbox_id, &add_secret_command(key, value)?).await?;
    Ok(())
}

pub async fn remove_secret<P>(provider: &P, sandbox_id: &str, key: &str) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    run_checked(provider, sandbox_id, &delete_secret_command(key)?).await?;
    Ok(())
}
