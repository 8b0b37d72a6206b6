// ABOUTME: HTTP API layer for Agentbox providing REST and SSE endpoints
// ABOUTME: Chat streaming, status, cancellation, queue, and sandbox routes over shared AppState

use axum::{
    routing::{delete, get, post},
    Router,
};

pub mod chat_handlers;
pub mod response;
pub mod sandbox_handlers;
pub mod sse;
pub mod state;

pub use response::{ApiError, ApiResponse};
pub use sse::SseConnectionTracker;
pub use state::AppState;

/// Creates the chats API router (nested under /api/chats)
pub fn create_chats_router() -> Router<AppState> {
    Router::new()
        .route("/", post(chat_handlers::create_chat))
        .route("/{chat_id}", get(chat_handlers::get_chat))
        .route(
            "/{chat_id}/messages",
            get(chat_handlers::list_messages).post(chat_handlers::send_message),
        )
        .route("/{chat_id}/stream", get(chat_handlers::stream_chat))
        .route("/{chat_id}/status", get(chat_handlers::get_stream_status))
        .route("/{chat_id}/cancel", post(chat_handlers::cancel_stream))
        .route(
            "/{chat_id}/queue",
            get(chat_handlers::get_queue)
                .post(chat_handlers::queue_message)
                .put(chat_handlers::update_queue)
                .delete(chat_handlers::clear_queue),
        )
}

/// Creates the sandbox API router (nested under /api/sandboxes)
pub fn create_sandboxes_router() -> Router<AppState> {
    Router::new()
        .route(
            "/{sandbox_id}/checkpoints",
            get(sandbox_handlers::list_checkpoints),
        )
        .route(
            "/{sandbox_id}/checkpoints/{checkpoint_id}/restore",
            post(sandbox_handlers::restore_checkpoint),
        )
        .route("/{sandbox_id}/previews", get(sandbox_handlers::get_previews))
        .route("/{sandbox_id}/ide", get(sandbox_handlers::get_ide_url))
        .route("/{sandbox_id}/vnc", get(sandbox_handlers::get_vnc_url))
        .route(
            "/{sandbox_id}/secrets",
            get(sandbox_handlers::list_secrets).post(sandbox_handlers::add_secret),
        )
        .route(
            "/{sandbox_id}/secrets/{key}",
            delete(sandbox_handlers::delete_secret),
        )
}

/// Full API router with state applied
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/chats", create_chats_router())
        .nest("/api/sandboxes", create_sandboxes_router())
        .with_state(state)
}

async fn health() -> axum::Json<ApiResponse<&'static str>> {
    axum::Json(ApiResponse::success("ok"))
}
