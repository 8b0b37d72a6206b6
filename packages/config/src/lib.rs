// ABOUTME: Shared configuration for Agentbox packages
// ABOUTME: Environment variable names, defaults, and lenient env parsing helpers

pub mod constants;
pub mod defaults;

use std::str::FromStr;
use tracing::warn;

/// Read an environment variable and parse it, falling back to `default` when the
/// variable is unset, unparseable, or rejected by `valid`.
pub fn env_or<T, F>(name: &str, default: T, valid: F) -> T
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => value,
            _ => {
                warn!("Ignoring invalid value for {}: {:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an optional string variable, treating empty values as unset.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a boolean flag. Accepts `1/0`, `true/false`, `yes/no`.
pub fn env_flag(name: &str, default: bool) -> bool {
    match env_string(name).map(|v| v.to_lowercase()) {
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        _ => default,
    }
}
