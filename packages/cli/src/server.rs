// ABOUTME: Wires stores, the sandbox provider, and the chat worker into the HTTP server
// ABOUTME: Shutdown interrupts running turns first so open streams receive their terminal event

use agentbox_api::{create_router, AppState};
use agentbox_sandbox::{provider_from_env, ProviderKind, SandboxProvider};
use agentbox_streaming::{
    open_pool, ChatWorker, SqliteMessageStore, SqliteStreamStore, StreamingConfig, WorkerDeps,
};
use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{ConfigError, ServerConfig};

/// Everything a running server owns
pub struct Services {
    pub state: AppState,
    pub worker: Arc<ChatWorker>,
    pub provider: Arc<dyn SandboxProvider>,
}

/// Open the database and build the worker and shared state around `provider`
pub async fn build_services(
    config: &ServerConfig,
    provider: Arc<dyn SandboxProvider>,
) -> anyhow::Result<Services> {
    let pool = open_pool(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;

    let worker = ChatWorker::new(WorkerDeps {
        store: Arc::new(SqliteStreamStore::new(pool.clone())),
        messages: Arc::new(SqliteMessageStore::new(pool)),
        sandbox: provider.clone(),
        config: StreamingConfig::from_env(),
    });

    Ok(Services {
        state: AppState::new(worker.clone()),
        worker,
        provider,
    })
}

/// API router with CORS and request tracing applied
pub fn build_app(state: AppState, cors_origin: &str) -> Result<Router, ConfigError> {
    let origin = cors_origin
        .parse::<HeaderValue>()
        .map_err(|_| ConfigError::InvalidCorsOrigin(cors_origin.to_string()))?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Ok(create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

async fn shutdown_signal(worker: Arc<ChatWorker>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, interrupting running turns");
    worker.shutdown().await;
}

pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let provider = provider_from_env(ProviderKind::from_env()?)?;
    let services = build_services(&config, provider).await?;
    let app = build_app(services.state, &config.cors_origin)?;

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Agentbox API listening on http://{}", addr);
    info!("CORS origin: {}", config.cors_origin);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(services.worker.clone()))
    .await?;

    services.provider.cleanup().await;
    info!("Server shut down gracefully");
    Ok(())
}
