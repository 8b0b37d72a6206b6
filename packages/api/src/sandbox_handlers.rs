// ABOUTME: HTTP handlers for sandbox checkpoints, preview links, IDE/VNC URLs, and secrets
// ABOUTME: Thin wrappers over the configured SandboxProvider; it validates ids and secret names

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::response::{created, ok, ApiResult};
use crate::state::AppState;

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult {
    Ok(ok(state.sandbox.list_checkpoints(&sandbox_id).await?))
}

pub async fn restore_checkpoint(
    State(state): State<AppState>,
    Path((sandbox_id, checkpoint_id)): Path<(String, String)>,
) -> ApiResult {
    info!(
        "Restoring checkpoint {} in sandbox {}",
        checkpoint_id, sandbox_id
    );
    state
        .sandbox
        .restore_checkpoint(&sandbox_id, &checkpoint_id)
        .await?;
    Ok(ok(json!({ "restored": checkpoint_id })))
}

pub async fn get_previews(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult {
    Ok(ok(state.sandbox.get_preview_links(&sandbox_id).await?))
}

pub async fn get_ide_url(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult {
    let url = state.sandbox.get_ide_url(&sandbox_id).await?;
    Ok(ok(json!({ "url": url })))
}

pub async fn get_vnc_url(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult {
    let url = state.sandbox.get_vnc_url(&sandbox_id).await?;
    Ok(ok(json!({ "url": url })))
}

pub async fn list_secrets(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult {
    Ok(ok(state.sandbox.get_secrets(&sandbox_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AddSecretRequest {
    pub key: String,
    pub value: String,
}

pub async fn add_secret(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<AddSecretRequest>,
) -> ApiResult {
    info!("Adding secret {} to sandbox {}", request.key, sandbox_id);
    state
        .sandbox
        .add_secret(&sandbox_id, &request.key, &request.value)
        .await?;
    Ok(created(json!({ "key": request.key })))
}

pub async fn delete_secret(
    State(state): State<AppState>,
    Path((sandbox_id, key)): Path<(String, String)>,
) -> ApiResult {
    info!("Removing secret {} from sandbox {}", key, sandbox_id);
    state.sandbox.delete_secret(&sandbox_id, &key).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
