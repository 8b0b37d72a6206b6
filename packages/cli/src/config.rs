// ABOUTME: HTTP server configuration read from the environment
// ABOUTME: Invalid values fall back to defaults; only an unusable bind address is an error

use agentbox_config::{constants, defaults, env_or, env_string};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid bind host: {0}")]
    InvalidHost(String),
    #[error("Invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub database_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::API_HOST.to_string(),
            port: defaults::API_PORT,
            cors_origin: defaults::CORS_ORIGIN.to_string(),
            database_url: defaults::DATABASE_URL.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string(constants::AGENTBOX_API_HOST)
                .unwrap_or_else(|| defaults::API_HOST.to_string()),
            port: env_or(constants::AGENTBOX_API_PORT, defaults::API_PORT, |&p| p > 0),
            cors_origin: env_string(constants::AGENTBOX_CORS_ORIGIN)
                .unwrap_or_else(|| defaults::CORS_ORIGIN.to_string()),
            database_url: env_string(constants::AGENTBOX_DATABASE_URL)
                .unwrap_or_else(|| defaults::DATABASE_URL.to_string()),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = match self.host.as_str() {
            "localhost" => IpAddr::from([127, 0, 0, 1]),
            host => host
                .parse()
                .map_err(|_| ConfigError::InvalidHost(host.to_string()))?,
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}
