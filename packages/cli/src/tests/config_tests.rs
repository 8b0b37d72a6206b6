// ABOUTME: Tests for environment-driven server configuration
// ABOUTME: Serialized because they mutate process environment variables

use crate::config::{ConfigError, ServerConfig};
use agentbox_config::constants;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::env;

fn clear_env() {
    for name in [
        constants::AGENTBOX_API_HOST,
        constants::AGENTBOX_API_PORT,
        constants::AGENTBOX_CORS_ORIGIN,
        constants::AGENTBOX_DATABASE_URL,
    ] {
        env::remove_var(name);
    }
}

#[test]
#[serial]
fn test_config_from_env_defaults() {
    clear_env();

    let config = ServerConfig::from_env();

    assert_eq!(config, ServerConfig::default());
    assert_eq!(config.port, 4001);
    assert_eq!(config.cors_origin, "http://localhost:5173");
    assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:4001");
}

#[test]
#[serial]
fn test_config_from_env_with_custom_values() {
    clear_env();
    env::set_var(constants::AGENTBOX_API_PORT, "8080");
    env::set_var(constants::AGENTBOX_API_HOST, "0.0.0.0");
    env::set_var(constants::AGENTBOX_CORS_ORIGIN, "https://app.example.com");
    env::set_var(constants::AGENTBOX_DATABASE_URL, "sqlite::memory:");

    let config = ServerConfig::from_env();

    assert_eq!(config.port, 8080);
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.cors_origin, "https://app.example.com");
    assert_eq!(config.database_url, "sqlite::memory:");

    clear_env();
}

#[test]
#[serial]
fn test_invalid_port_falls_back_to_default() {
    clear_env();
    env::set_var(constants::AGENTBOX_API_PORT, "not-a-number");
    assert_eq!(ServerConfig::from_env().port, 4001);

    env::set_var(constants::AGENTBOX_API_PORT, "0");
    assert_eq!(ServerConfig::from_env().port, 4001);

    env::set_var(constants::AGENTBOX_API_PORT, "70000");
    assert_eq!(ServerConfig::from_env().port, 4001);

    clear_env();
}

#[test]
fn test_socket_addr_rejects_hostnames() {
    let config = ServerConfig {
        host: "example.com".to_string(),
        ..ServerConfig::default()
    };
    assert!(matches!(
        config.socket_addr(),
        Err(ConfigError::InvalidHost(_))
    ));

    let local = ServerConfig {
        host: "localhost".to_string(),
        port: 9000,
        ..ServerConfig::default()
    };
    assert_eq!(local.socket_addr().unwrap().to_string(), "127.0.0.1:9000");
}
