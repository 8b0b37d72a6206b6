// ABOUTME: Producer side of the per-chat durable log
// ABOUTME: Writes content, terminal, and queue notices; owns the active-task marker lifecycle

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::events::{StreamEvent, StreamEventKind};
use crate::keys;
use crate::store::StreamStore;

/// Body of `queue_injected` and `queue_processing` entries
#[derive(Debug, Clone, Serialize)]
pub struct QueueNotice {
    pub queued_message_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub content: String,
    pub model_id: String,
    pub attachments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub injected_inline: bool,
}

/// Payload of a log entry: raw strings pass through, structured values are JSON-encoded
pub enum Payload {
    Raw(String),
    Json(Value),
}

pub struct StreamPublisher {
    chat_id: String,
    store: Arc<dyn StreamStore>,
    max_len: usize,
    task_ttl: Duration,
    task_id: Option<String>,
}

impl StreamPublisher {
    pub fn new(
        chat_id: impl Into<String>,
        store: Arc<dyn StreamStore>,
        max_len: usize,
        task_ttl: Duration,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            store,
            max_len,
            task_ttl,
            task_id: None,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// Claim the chat for `task_id`. A fresh turn starts from an empty log; a queue
    /// continuation keeps the previous entries so reconnecting clients can replay them.
    pub async fn connect(&mut self, task_id: &str, skip_stream_delete: bool) {
        self.task_id = Some(task_id.to_string());
        if !skip_stream_delete {
            if let Err(e) = self.store.delete_log(&keys::stream_key(&self.chat_id)).await {
                error!("Failed to reset stream for chat {}: {}", self.chat_id, e);
            }
        }
        if let Err(e) = self
            .store
            .set_with_ttl(&keys::task_key(&self.chat_id), task_id, self.task_ttl)
            .await
        {
            error!("Failed to set task marker for chat {}: {}", self.chat_id, e);
        }
    }

    /// Append one entry. Failures are logged; producers never stop on a lost entry.
    pub async fn publish(&self, kind: StreamEventKind, payload: Option<Payload>) {
        let encoded = match payload {
            None => None,
            Some(Payload::Raw(text)) => Some(text),
            Some(Payload::Json(value)) => match serde_json::to_string(&value) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("Dropping unserializable {} payload: {}", kind.as_str(), e);
                    return;
                }
            },
        };

        if let Err(e) = self
            .store
            .append(
                &keys::stream_key(&self.chat_id),
                kind.as_str(),
                encoded.as_deref(),
                self.max_len,
            )
            .await
        {
            warn!(chat_id = %self.chat_id, "Failed to append stream entry: {}", e);
        }
    }

    pub async fn publish_event(&self, event: &StreamEvent) {
        self.publish(
            StreamEventKind::Content,
            Some(Payload::Json(json!({ "event": event }))),
        )
        .await;
    }

    pub async fn publish_complete(&self) {
        self.publish(StreamEventKind::Complete, None).await;
    }

    pub async fn publish_error(&self, error: &str) {
        self.publish(
            StreamEventKind::Error,
            Some(Payload::Json(json!({ "error": error }))),
        )
        .await;
    }

    pub async fn publish_queue_event(&self, notice: &QueueNotice) {
        let kind = if notice.injected_inline {
            StreamEventKind::QueueInjected
        } else {
            StreamEventKind::QueueProcessing
        };
        match serde_json::to_value(notice) {
            Ok(value) => self.publish(kind, Some(Payload::Json(value))).await,
            Err(e) => warn!("Failed to encode queue notice: {}", e),
        }
    }

    pub async fn clear_stream(&self) {
        if let Err(e) = self.store.delete_log(&keys::stream_key(&self.chat_id)).await {
            warn!("Failed to clear stream for chat {}: {}", self.chat_id, e);
        }
    }

    /// Release the task marker and revoked flag, unless a continuation has
    /// already taken the chat over
    pub async fn cleanup(&self) {
        let task_key = keys::task_key(&self.chat_id);
        match self.store.get(&task_key).await {
            Ok(Some(current)) if Some(current.as_str()) != self.task_id.as_deref() => {
                debug!(
                    "Chat {} now belongs to task {}, leaving markers in place",
                    self.chat_id, current
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read task marker for chat {}: {}", self.chat_id, e);
                return;
            }
        }

        if let Err(e) = self.store.delete(&task_key).await {
            error!("Failed to delete task marker for chat {}: {}", self.chat_id, e);
        }
        if let Err(e) = self.store.delete(&keys::revoked_key(&self.chat_id)).await {
            error!("Failed to delete revoked flag for chat {}: {}", self.chat_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStreamStore;
    use pretty_assertions::assert_eq;

    fn publisher(store: &Arc<MemoryStreamStore>) -> StreamPublisher {
        StreamPublisher::new("c1", store.clone(), 100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_connect_resets_log_unless_continuation() {
        let store = Arc::new(MemoryStreamStore::new());
        let mut first = publisher(&store);
        first.connect("task-1", false).await;
        first.publish_event(&StreamEvent::text("a")).await;

        let mut continuation = publisher(&store);
        continuation.connect("task-2", true).await;
        let entries = store.read_after("chat:c1:stream", None, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            store.get("chat:c1:task").await.unwrap().as_deref(),
            Some("task-2")
        );

        let mut fresh = publisher(&store);
        fresh.connect("task-3", false).await;
        assert!(store
            .read_after("chat:c1:stream", None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_entry_shapes() {
        let store = Arc::new(MemoryStreamStore::new());
        let publisher = publisher(&store);
        publisher.publish_event(&StreamEvent::text("hi")).await;
        publisher.publish_error("boom").await;
        publisher.publish_complete().await;
        publisher
            .publish(StreamEventKind::Content, Some(Payload::Raw("raw".into())))
            .await;
        publisher
            .publish_queue_event(&QueueNotice {
                queued_message_id: "q".into(),
                user_message_id: "u".into(),
                assistant_message_id: "a".into(),
                content: "next".into(),
                model_id: "m".into(),
                attachments: None,
                injected_inline: false,
            })
            .await;

        let entries = store.read_after("chat:c1:stream", None, None).await.unwrap();
        let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["content", "error", "complete", "content", "queue_processing"]
        );

        let content: Value = serde_json::from_str(entries[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(content["event"]["text"], "hi");
        assert_eq!(entries[1].payload.as_deref(), Some(r#"{"error":"boom"}"#));
        assert!(entries[2].payload.is_none());
        assert_eq!(entries[3].payload.as_deref(), Some("raw"));

        let notice: Value = serde_json::from_str(entries[4].payload.as_deref().unwrap()).unwrap();
        assert!(notice.get("injected_inline").is_none());
        assert_eq!(notice["assistant_message_id"], "a");
    }

    #[tokio::test]
    async fn test_cleanup_leaves_successor_marker() {
        let store = Arc::new(MemoryStreamStore::new());
        let mut old = publisher(&store);
        old.connect("task-1", false).await;
        let mut next = publisher(&store);
        next.connect("task-2", true).await;

        old.cleanup().await;
        assert_eq!(
            store.get("chat:c1:task").await.unwrap().as_deref(),
            Some("task-2")
        );

        next.cleanup().await;
        assert!(store.get("chat:c1:task").await.unwrap().is_none());
    }
}
