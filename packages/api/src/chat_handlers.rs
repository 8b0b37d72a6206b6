// ABOUTME: HTTP handlers for chats, their SSE stream, status, cancellation, and queued follow-ups
// ABOUTME: Sending a message either starts a worker run or queues it behind the active stream

use agentbox_streaming::{
    queue::DEFAULT_PERMISSION_MODE, request_cancel, stream_status, Chat, ChatRequest,
    MessageStreamStatus, NewMessage, QueueSubmission, QueueUpsertResponse, StreamingError,
    TaskLiveness,
};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::response::{created, ok, ApiError, ApiResponse, ApiResult};
use crate::sse::{create_sse_response, reader_event_to_sse, GuardedSseStream};
use crate::state::{AppState, DEFAULT_USER_ID};

const PERMISSION_MODES: [&str; 3] = ["plan", "ask", "auto"];

fn validate_permission_mode(mode: Option<&str>) -> Result<(), ApiError> {
    match mode {
        Some(mode) if !PERMISSION_MODES.contains(&mode) => Err(ApiError::BadRequest(format!(
            "Invalid permission mode: {} (expected plan, ask, or auto)",
            mode
        ))),
        _ => Ok(()),
    }
}

fn validate_content(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is required".to_string()));
    }
    Ok(())
}

async fn require_chat(state: &AppState, chat_id: &str) -> Result<Chat, ApiError> {
    state
        .messages
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| StreamingError::chat_not_found(chat_id).into())
}

// ==================== Chats ====================

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub title: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Create a chat together with the sandbox its turns run in
pub async fn create_chat(
    State(state): State<AppState>,
    Json(request): Json<CreateChatRequest>,
) -> ApiResult {
    let user_id = request.user_id.as_deref().unwrap_or(DEFAULT_USER_ID);
    info!("Creating chat '{}' for user {}", request.title, user_id);

    let sandbox_id = state.sandbox.create().await?;
    let chat = state
        .messages
        .create_chat(user_id, &request.title, Some(&sandbox_id))
        .await?;
    Ok(created(chat))
}

pub async fn get_chat(State(state): State<AppState>, Path(chat_id): Path<String>) -> ApiResult {
    Ok(ok(require_chat(&state, &chat_id).await?))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult {
    require_chat(&state, &chat_id).await?;
    Ok(ok(state.messages.list_messages(&chat_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendMessageResponse {
    Started {
        user_message_id: String,
        assistant_message_id: String,
        task_id: String,
    },
    /// A stream was already running; the message waits in the chat's queue
    Queued { queued: QueueUpsertResponse },
}

/// Start a turn, or queue the message when the chat already has one running
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult {
    validate_content(&request.content)?;
    validate_permission_mode(request.permission_mode.as_deref())?;
    require_chat(&state, &chat_id).await?;

    let status = stream_status(
        state.store.as_ref(),
        state.messages.as_ref(),
        Some(state.worker.as_ref() as &dyn TaskLiveness),
        &chat_id,
    )
    .await?;

    if status.has_active_task {
        info!("Chat {} is streaming, queueing the new message", chat_id);
        let queued = state
            .queue
            .upsert_message(
                &chat_id,
                QueueSubmission {
                    content: request.content,
                    model_id: request.model_id,
                    permission_mode: request.permission_mode,
                    thinking_mode: request.thinking_mode,
                    attachments: request.attachments,
                },
            )
            .await?;
        let body = ApiResponse::success(SendMessageResponse::Queued { queued });
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let user = state
        .messages
        .create_message(
            &chat_id,
            NewMessage::user(request.content.clone(), request.attachments.clone()),
        )
        .await?;
    let assistant = state
        .messages
        .create_message(&chat_id, NewMessage::pending_assistant(&request.model_id))
        .await?;

    let chat_request = ChatRequest {
        chat_id: chat_id.clone(),
        prompt: request.content,
        model_id: request.model_id,
        permission_mode: request
            .permission_mode
            .unwrap_or_else(|| DEFAULT_PERMISSION_MODE.to_string()),
        thinking_mode: request.thinking_mode,
        attachments: request.attachments,
        assistant_message_id: Some(assistant.id.clone()),
        session_id: None,
        system_prompt: request.system_prompt,
        is_queue_continuation: false,
    };

    let task_id = match state.worker.dispatch(chat_request).await {
        Ok(task_id) => task_id,
        Err(e) => {
            // The placeholder never gets a stream; close it out
            if let Err(mark) = state
                .messages
                .update_status(&assistant.id, MessageStreamStatus::Failed)
                .await
            {
                warn!("Failed to mark message {} as failed: {}", assistant.id, mark);
            }
            return Err(e.into());
        }
    };

    Ok(created(SendMessageResponse::Started {
        user_message_id: user.id,
        assistant_message_id: assistant.id,
        task_id,
    }))
}

// ==================== Streaming ====================

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "lastEventId")]
    pub last_event_id: Option<String>,
}

/// Replay the chat's log from the client's cursor, then follow it live
pub async fn stream_chat(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult {
    require_chat(&state, &chat_id).await?;

    let guard = state
        .sse_tracker
        .try_acquire(addr.ip())
        .map_err(|_| ApiError::TooManyConnections)?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id)
        .filter(|id| !id.trim().is_empty());
    info!(
        chat_id = %chat_id,
        last_event_id = ?last_event_id,
        "Opening chat stream"
    );

    let events = state
        .reader
        .events(chat_id, last_event_id)
        .map(|event| Ok::<_, Infallible>(reader_event_to_sse(event)));

    let mut response = create_sse_response(GuardedSseStream::new(events, guard)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

pub async fn get_stream_status(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult {
    require_chat(&state, &chat_id).await?;
    let status = stream_status(
        state.store.as_ref(),
        state.messages.as_ref(),
        Some(state.worker.as_ref() as &dyn TaskLiveness),
        &chat_id,
    )
    .await?;
    Ok(ok(status))
}

pub async fn cancel_stream(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult {
    require_chat(&state, &chat_id).await?;
    let cancelled = request_cancel(state.store.as_ref(), &chat_id, state.config.revoked_ttl).await?;
    if cancelled {
        info!("Cancellation requested for chat {}", chat_id);
    }
    Ok(ok(json!({ "cancelled": cancelled })))
}

// ==================== Queue ====================

pub async fn get_queue(State(state): State<AppState>, Path(chat_id): Path<String>) -> ApiResult {
    Ok(ok(state.queue.get_message(&chat_id).await?))
}

pub async fn queue_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(submission): Json<QueueSubmission>,
) -> ApiResult {
    validate_content(&submission.content)?;
    validate_permission_mode(submission.permission_mode.as_deref())?;
    require_chat(&state, &chat_id).await?;

    let result = state.queue.upsert_message(&chat_id, submission).await?;
    if result.created {
        Ok(created(result))
    } else {
        Ok(ok(result))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    pub content: String,
}

pub async fn update_queue(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<UpdateQueueRequest>,
) -> ApiResult {
    validate_content(&request.content)?;
    match state.queue.update_message(&chat_id, &request.content).await? {
        Some(message) => Ok(ok(message)),
        None => Err(ApiError::NotFound(format!(
            "No queued message for chat {}",
            chat_id
        ))),
    }
}

pub async fn clear_queue(State(state): State<AppState>, Path(chat_id): Path<String>) -> ApiResult {
    if state.queue.clear_queue(&chat_id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError::NotFound(format!(
            "No queued message for chat {}",
            chat_id
        )))
    }
}
