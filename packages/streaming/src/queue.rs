// ABOUTME: Single-slot queued follow-up message per chat with optimistic concurrency
// ABOUTME: Repeated submissions append to the pending message instead of replacing it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StreamingError};
use crate::keys;
use crate::store::StreamStore;

/// Attempts before a contended upsert gives up
pub const MAX_UPSERT_ATTEMPTS: u32 = 5;

pub const DEFAULT_PERMISSION_MODE: &str = "auto";

fn default_permission_mode() -> String {
    DEFAULT_PERMISSION_MODE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub model_id: String,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
}

/// A submission to the queue
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSubmission {
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueUpsertResponse {
    pub id: String,
    /// `false` when the submission was appended to an existing message
    pub created: bool,
    pub content: String,
    pub attachments: Option<Vec<Value>>,
}

#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn StreamStore>,
    ttl: Duration,
}

impl QueueService {
    pub fn new(store: Arc<dyn StreamStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Create the chat's queued message, or append to the one already waiting
    pub async fn upsert_message(
        &self,
        chat_id: &str,
        submission: QueueSubmission,
    ) -> Result<QueueUpsertResponse> {
        let key = keys::queue_key(chat_id);

        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let current = self.store.get_versioned(&key).await?;

            let (message, created) = match current.value {
                Some(raw) => {
                    let mut message: QueuedMessage = serde_json::from_str(&raw)?;
                    message.content.push('\n');
                    message.content.push_str(&submission.content);
                    if let Some(extra) = submission.attachments.as_ref().filter(|a| !a.is_empty()) {
                        message
                            .attachments
                            .get_or_insert_with(Vec::new)
                            .extend(extra.iter().cloned());
                    }
                    (message, false)
                }
                None => (
                    QueuedMessage {
                        id: Uuid::new_v4().to_string(),
                        content: submission.content.clone(),
                        model_id: submission.model_id.clone(),
                        permission_mode: submission
                            .permission_mode
                            .clone()
                            .unwrap_or_else(default_permission_mode),
                        thinking_mode: submission.thinking_mode.clone(),
                        queued_at: Utc::now(),
                        attachments: submission.attachments.clone(),
                    },
                    true,
                ),
            };

            let encoded = serde_json::to_string(&message)?;
            if self
                .store
                .compare_and_set(&key, current.version, &encoded, self.ttl)
                .await?
            {
                info!(
                    "{} queued message {} for chat {}",
                    if created { "Created" } else { "Appended to" },
                    message.id,
                    chat_id
                );
                return Ok(QueueUpsertResponse {
                    id: message.id,
                    created,
                    content: message.content,
                    attachments: message.attachments,
                });
            }
            debug!(
                "Queued message for chat {} changed concurrently (attempt {})",
                chat_id, attempt
            );
        }

        Err(StreamingError::QueueConflict {
            chat_id: chat_id.to_string(),
            attempts: MAX_UPSERT_ATTEMPTS,
        })
    }

    pub async fn get_message(&self, chat_id: &str) -> Result<Option<QueuedMessage>> {
        match self.store.get(&keys::queue_key(chat_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Replace the queued content. `None` when nothing is queued.
    pub async fn update_message(
        &self,
        chat_id: &str,
        content: &str,
    ) -> Result<Option<QueuedMessage>> {
        let key = keys::queue_key(chat_id);

        for _ in 0..MAX_UPSERT_ATTEMPTS {
            let current = self.store.get_versioned(&key).await?;
            let Some(raw) = current.value else {
                return Ok(None);
            };
            let mut message: QueuedMessage = serde_json::from_str(&raw)?;
            message.content = content.to_string();

            let encoded = serde_json::to_string(&message)?;
            if self
                .store
                .compare_and_set(&key, current.version, &encoded, self.ttl)
                .await?
            {
                return Ok(Some(message));
            }
        }

        Err(StreamingError::QueueConflict {
            chat_id: chat_id.to_string(),
            attempts: MAX_UPSERT_ATTEMPTS,
        })
    }

    /// Returns whether anything was queued
    pub async fn clear_queue(&self, chat_id: &str) -> Result<bool> {
        self.store.delete(&keys::queue_key(chat_id)).await
    }

    /// Take the queued message, leaving the slot empty
    pub async fn pop_next_message(&self, chat_id: &str) -> Result<Option<QueuedMessage>> {
        match self.store.get_del(&keys::queue_key(chat_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn has_messages(&self, chat_id: &str) -> Result<bool> {
        Ok(self.store.get(&keys::queue_key(chat_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStreamStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn service() -> QueueService {
        QueueService::new(Arc::new(MemoryStreamStore::new()), Duration::from_secs(3600))
    }

    fn submission(content: &str) -> QueueSubmission {
        QueueSubmission {
            content: content.to_string(),
            model_id: "sonnet".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_appends_with_newline() {
        let queue = service();
        let first = queue.upsert_message("c1", submission("fix the test")).await.unwrap();
        assert!(first.created);

        let mut second = submission("and update docs");
        second.attachments = Some(vec![json!({"file_path": "uploads/a.png"})]);
        let appended = queue.upsert_message("c1", second).await.unwrap();
        assert!(!appended.created);
        assert_eq!(appended.id, first.id);
        assert_eq!(appended.content, "fix the test\nand update docs");

        let stored = queue.get_message("c1").await.unwrap().unwrap();
        assert_eq!(stored.permission_mode, "auto");
        assert_eq!(stored.attachments.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pop_empties_the_slot() {
        let queue = service();
        assert!(!queue.has_messages("c1").await.unwrap());
        queue.upsert_message("c1", submission("next")).await.unwrap();
        assert!(queue.has_messages("c1").await.unwrap());

        let popped = queue.pop_next_message("c1").await.unwrap().unwrap();
        assert_eq!(popped.content, "next");
        assert!(queue.pop_next_message("c1").await.unwrap().is_none());
        assert!(!queue.clear_queue("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_replaces_content() {
        let queue = service();
        assert!(queue.update_message("c1", "x").await.unwrap().is_none());

        queue.upsert_message("c1", submission("old")).await.unwrap();
        let updated = queue.update_message("c1", "new").await.unwrap().unwrap();
        assert_eq!(updated.content, "new");
        assert!(queue.clear_queue("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_all_land() {
        let queue = service();
        let mut handles = Vec::new();
        for n in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.upsert_message("c1", submission(&format!("m{}", n))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = queue.get_message("c1").await.unwrap().unwrap();
        let mut parts: Vec<&str> = stored.content.split('\n').collect();
        parts.sort();
        assert_eq!(parts, vec!["m0", "m1", "m2", "m3"]);
    }
}
