// ABOUTME: Active-stream status for reconnecting clients and cancel requests
// ABOUTME: Stale task markers are cleared lazily whenever status is read

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::keys;
use crate::messages::MessageStore;
use crate::store::StreamStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub has_active_task: bool,
    pub message_id: Option<String>,
    pub last_event_id: Option<String>,
}

impl StreamStatus {
    pub fn inactive() -> Self {
        Self {
            has_active_task: false,
            message_id: None,
            last_event_id: None,
        }
    }
}

/// Whether a task still runs in this process
pub trait TaskLiveness: Send + Sync {
    fn is_task_alive(&self, chat_id: &str, task_id: &str) -> bool;
}

/// Report whether the chat has a live stream, and where a client should resume it.
///
/// The marker is dropped when the latest assistant message already reached a
/// terminal state, when a cancel was requested, or when `liveness` knows the
/// task is gone.
pub async fn stream_status(
    store: &dyn StreamStore,
    messages: &dyn MessageStore,
    liveness: Option<&dyn TaskLiveness>,
    chat_id: &str,
) -> Result<StreamStatus> {
    let task_key = keys::task_key(chat_id);
    let latest = messages.latest_assistant_message(chat_id).await?;

    if latest
        .as_ref()
        .and_then(|message| message.stream_status)
        .is_some_and(|status| status.is_terminal())
    {
        store.delete(&task_key).await?;
        return Ok(StreamStatus::inactive());
    }

    let Some(task_id) = store.get(&task_key).await? else {
        return Ok(StreamStatus::inactive());
    };

    if store.get(&keys::revoked_key(chat_id)).await?.is_some() {
        store.delete(&task_key).await?;
        return Ok(StreamStatus::inactive());
    }

    if let Some(liveness) = liveness {
        if !liveness.is_task_alive(chat_id, &task_id) {
            info!("Clearing stale task marker {} for chat {}", task_id, chat_id);
            store.delete(&task_key).await?;
            return Ok(StreamStatus::inactive());
        }
    }

    let last_event_id = match store.read_latest(&keys::stream_key(chat_id), 1).await {
        Ok(entries) => entries.into_iter().next().map(|entry| entry.id),
        Err(e) => {
            debug!("Could not read latest stream entry for chat {}: {}", chat_id, e);
            None
        }
    };

    Ok(StreamStatus {
        has_active_task: true,
        message_id: latest.map(|message| message.id),
        last_event_id,
    })
}

/// Ask the chat's running stream to stop. `false` when nothing is running.
pub async fn request_cancel(
    store: &dyn StreamStore,
    chat_id: &str,
    revoked_ttl: Duration,
) -> Result<bool> {
    if store.get(&keys::task_key(chat_id)).await?.is_none() {
        return Ok(false);
    }

    store
        .set_with_ttl(&keys::revoked_key(chat_id), "1", revoked_ttl)
        .await?;
    let receivers = store.publish(&keys::cancel_channel(chat_id), "cancel").await?;
    info!(
        "Cancel requested for chat {} ({} listeners)",
        chat_id, receivers
    );
    Ok(true)
}
