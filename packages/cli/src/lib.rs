// ABOUTME: Library half of the agentbox binary: server configuration and wiring
// ABOUTME: Kept separate from main so the router setup can be tested without binding a port

pub mod config;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{build_app, build_services, run_server, Services};

/// Install the global tracing subscriber. `RUST_LOG` wins over the `info` default.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests;
