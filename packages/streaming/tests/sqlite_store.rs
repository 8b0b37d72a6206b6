// ABOUTME: Integration tests for the SQLite stream store and message store
// ABOUTME: Runs against an in-memory database with the embedded migrations applied

mod common;

use agentbox_streaming::{
    open_pool, MessageRole, MessageStore, MessageStreamStatus, NewMessage, SqliteStreamStore,
    StreamStore, StreamingError,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LOG: &str = "chat:c1:stream";

async fn store() -> Arc<SqliteStreamStore> {
    Arc::new(SqliteStreamStore::new(open_pool("sqlite::memory:").await.unwrap()))
}

#[tokio::test]
async fn test_append_is_ordered_and_trimmed() {
    let store = store().await;
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(store.append(LOG, "content", Some(&n.to_string()), 3).await.unwrap());
    }
    let mut sorted = ids.clone();
    sorted.sort_by_key(|id| agentbox_streaming::Cursor::parse(id).unwrap());
    assert_eq!(ids, sorted);

    let entries = store.read_after(LOG, None, None).await.unwrap();
    let payloads: Vec<&str> = entries.iter().filter_map(|e| e.payload.as_deref()).collect();
    assert_eq!(payloads, vec!["2", "3", "4"]);

    let after = store.read_after(LOG, Some(&ids[3]), None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, ids[4]);

    let latest = store.read_latest(LOG, 2).await.unwrap();
    assert_eq!(latest[0].id, ids[4]);
    assert_eq!(latest[1].id, ids[3]);

    // Trimmed cursor behaves like the start of what remains
    let trimmed = store.read_after(LOG, Some(&ids[0]), None).await.unwrap();
    assert_eq!(trimmed.len(), 3);
}

#[tokio::test]
async fn test_cursors_survive_delete_log() {
    let store = store().await;
    let before = store.append(LOG, "content", None, 10).await.unwrap();
    store.delete_log(LOG).await.unwrap();
    assert!(store.read_after(LOG, None, None).await.unwrap().is_empty());

    let after = store.append(LOG, "complete", None, 10).await.unwrap();
    let entries = store.read_after(LOG, Some(&before), None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, after);
}

#[tokio::test]
async fn test_wait_read_after_wakes_on_append() {
    let store = store().await;
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .wait_read_after(LOG, None, 10, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.append(LOG, "content", Some("x"), 10).await.unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entries.len(), 1);

    let empty = store
        .wait_read_after(LOG, Some(&entries[0].id), 10, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_keys_versions_and_expiry() {
    let store = store().await;
    assert_eq!(store.get_versioned("k").await.unwrap().version, 0);

    assert!(store
        .compare_and_set("k", 0, "one", Duration::from_secs(60))
        .await
        .unwrap());
    // A second creator loses
    assert!(!store
        .compare_and_set("k", 0, "other", Duration::from_secs(60))
        .await
        .unwrap());

    let current = store.get_versioned("k").await.unwrap();
    assert_eq!(current.value.as_deref(), Some("one"));
    store.set_with_ttl("k", "two", Duration::from_secs(60)).await.unwrap();
    assert!(!store
        .compare_and_set("k", current.version, "stale", Duration::from_secs(60))
        .await
        .unwrap());

    assert_eq!(store.get_del("k").await.unwrap().as_deref(), Some("two"));
    assert!(store.get("k").await.unwrap().is_none());
    assert!(!store.delete("k").await.unwrap());

    store
        .set_with_ttl("short", "v", Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.get("short").await.unwrap().is_none());
    // Expired keys count as absent for compare-and-set
    assert!(store
        .compare_and_set("short", 0, "again", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_publish_reaches_current_subscribers() {
    let store = store().await;
    assert_eq!(store.publish("chat:c1:cancel", "cancel").await.unwrap(), 0);

    let mut subscription = store.subscribe("chat:c1:cancel").await.unwrap();
    assert_eq!(store.publish("chat:c1:cancel", "cancel").await.unwrap(), 1);
    assert_eq!(subscription.recv().await.as_deref(), Some("cancel"));
}

#[tokio::test]
async fn test_message_lifecycle() {
    let messages = message_store().await;
    let chat = messages.create_chat("u1", "Fix the build", None).await.unwrap();
    assert!(chat.sandbox_id.is_none());

    messages.set_chat_sandbox(&chat.id, "sb-1").await.unwrap();
    messages.update_chat_session(&chat.id, "sess").await.unwrap();
    let chat = messages.get_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(chat.sandbox_id.as_deref(), Some("sb-1"));
    assert_eq!(chat.session_id.as_deref(), Some("sess"));

    let attachments = vec![json!({"file_path": "uploads/a.png"})];
    let user = messages
        .create_message(&chat.id, NewMessage::user("look", Some(attachments.clone())))
        .await
        .unwrap();
    assert_eq!(user.role, MessageRole::User);
    assert_eq!(user.attachments, Some(attachments));

    let assistant = messages
        .create_message(&chat.id, NewMessage::pending_assistant("sonnet"))
        .await
        .unwrap();
    assert_eq!(assistant.stream_status, Some(MessageStreamStatus::InProgress));

    messages
        .save_content(&assistant.id, "[]", 0.75, MessageStreamStatus::Completed)
        .await
        .unwrap();
    messages.set_checkpoint(&assistant.id, "ckpt-1").await.unwrap();
    messages.set_message_session(&assistant.id, "sess").await.unwrap();

    let latest = messages
        .latest_assistant_message(&chat.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, assistant.id);
    assert_eq!(latest.stream_status, Some(MessageStreamStatus::Completed));
    assert_eq!(latest.total_cost_usd, 0.75);
    assert_eq!(latest.checkpoint_id.as_deref(), Some("ckpt-1"));
    assert_eq!(latest.session_id.as_deref(), Some("sess"));

    let listed = messages.list_messages(&chat.id).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![user.id.as_str(), assistant.id.as_str()]);
}

#[tokio::test]
async fn test_missing_rows_are_not_found() {
    let messages = message_store().await;
    assert!(messages.get_chat("nope").await.unwrap().is_none());

    let err = messages
        .create_message("nope", NewMessage::user("hi", None))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = messages
        .update_status("nope", MessageStreamStatus::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamingError::NotFound { .. }));
}
