// ABOUTME: Integration tests for the replay/live stream reader
// ABOUTME: Ordering, resume without gaps, live tailing, log clears, and cancellation latency

use agentbox_streaming::{
    open_pool, request_cancel, MemoryStreamStore, ReaderEvent, SqliteStreamStore, StreamReader,
    StreamStore,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOG: &str = "chat:c1:stream";
const TASK: &str = "chat:c1:task";
const TTL: Duration = Duration::from_secs(3600);

async fn sqlite_store() -> Arc<SqliteStreamStore> {
    Arc::new(SqliteStreamStore::new(open_pool("sqlite::memory:").await.unwrap()))
}

async fn append_contents(store: &dyn StreamStore, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for n in 0..count {
        ids.push(
            store
                .append(LOG, "content", Some(&n.to_string()), 1000)
                .await
                .unwrap(),
        );
    }
    ids
}

fn data(events: &[ReaderEvent]) -> Vec<String> {
    events.iter().map(|event| event.data.clone()).collect()
}

#[tokio::test]
async fn test_fresh_reader_sees_all_events_then_terminal() {
    let store = sqlite_store().await;
    append_contents(store.as_ref(), 5).await;
    store.append(LOG, "complete", None, 1000).await.unwrap();

    let reader = StreamReader::new(store, Duration::from_secs(3600));
    let events: Vec<ReaderEvent> = reader.events("c1", None).collect().await;

    assert_eq!(events.len(), 6);
    assert_eq!(data(&events[..5]), vec!["0", "1", "2", "3", "4"]);
    assert_eq!(events[5].event, "complete");
    assert!(events.iter().all(|event| event.id.is_some()));
}

#[tokio::test]
async fn test_content_then_complete_never_goes_live() {
    let store = sqlite_store().await;
    store.append(LOG, "content", Some("a"), 1000).await.unwrap();
    store.append(LOG, "complete", None, 1000).await.unwrap();
    // Anything after the terminal entry must not be read
    store.append(LOG, "content", Some("b"), 1000).await.unwrap();

    let reader = StreamReader::new(store, Duration::from_secs(3600));
    let events: Vec<ReaderEvent> = reader.events("c1", None).collect().await;

    let summary: Vec<(String, String)> = events
        .into_iter()
        .map(|event| (event.event, event.data))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("content".to_string(), "a".to_string()),
            ("complete".to_string(), String::new())
        ]
    );
}

#[tokio::test]
async fn test_resume_after_cursor_has_no_gaps_or_duplicates() {
    let store = Arc::new(MemoryStreamStore::new());
    let ids = append_contents(store.as_ref(), 6).await;
    store.append(LOG, "complete", None, 1000).await.unwrap();

    let reader = StreamReader::new(store, Duration::from_secs(3600));
    let events: Vec<ReaderEvent> = reader.events("c1", Some(ids[2].clone())).collect().await;

    assert_eq!(data(&events[..3]), vec!["3", "4", "5"]);
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].id.as_deref(), Some(ids[3].as_str()));
}

#[tokio::test]
async fn test_malformed_cursor_replays_from_start() {
    let store = Arc::new(MemoryStreamStore::new());
    append_contents(store.as_ref(), 2).await;
    store.append(LOG, "error", Some("{\"error\":\"boom\"}"), 1000).await.unwrap();

    let reader = StreamReader::new(store, Duration::from_secs(3600));
    let events: Vec<ReaderEvent> = reader
        .events("c1", Some("not-a-cursor".to_string()))
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[2].event, "error");
}

#[tokio::test]
async fn test_live_tail_follows_producer_across_a_clear() {
    let store = sqlite_store().await;
    store.set_with_ttl(TASK, "task-1", TTL).await.unwrap();
    append_contents(store.as_ref(), 1).await;

    let reader = StreamReader::new(store.clone(), Duration::from_millis(100));
    let collector = tokio::spawn(reader.events("c1", None).collect::<Vec<ReaderEvent>>());

    tokio::time::sleep(Duration::from_millis(50)).await;
    store.append(LOG, "content", Some("live"), 1000).await.unwrap();
    // Injection restarts the log; cursors keep increasing so the reader carries on
    store.delete_log(LOG).await.unwrap();
    store.append(LOG, "queue_injected", Some("{}"), 1000).await.unwrap();
    store.append(LOG, "content", Some("after"), 1000).await.unwrap();
    store.append(LOG, "complete", None, 1000).await.unwrap();

    let events = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();
    let kinds: Vec<&str> = events.iter().map(|event| event.event.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"content"));
    assert_eq!(kinds.last(), Some(&"complete"));
    assert!(kinds.contains(&"queue_injected"));
    assert!(data(&events).contains(&"after".to_string()));
}

#[tokio::test]
async fn test_cancel_signal_ends_live_reader_within_a_poll() {
    let poll = Duration::from_millis(300);
    let store = Arc::new(MemoryStreamStore::new());
    store.set_with_ttl(TASK, "task-1", TTL).await.unwrap();
    append_contents(store.as_ref(), 1).await;

    let reader = StreamReader::new(store.clone(), poll);
    let mut events = Box::pin(reader.events("c1", None));
    assert_eq!(events.next().await.unwrap().data, "0");

    let pending = tokio::spawn(async move {
        let mut rest = Vec::new();
        while let Some(event) = events.next().await {
            rest.push(event);
        }
        rest
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(request_cancel(store.as_ref(), "c1", TTL).await.unwrap());
    let rest = tokio::time::timeout(poll * 2, pending).await.unwrap().unwrap();

    assert!(started.elapsed() <= poll * 2);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].event, "complete");
    assert_eq!(rest[0].data, r#"{"status":"cancelled"}"#);
    assert!(rest[0].id.is_none());
}

#[tokio::test]
async fn test_revoked_chat_ends_immediately_after_backlog() {
    let store = sqlite_store().await;
    store.set_with_ttl(TASK, "task-1", TTL).await.unwrap();
    append_contents(store.as_ref(), 2).await;
    request_cancel(store.as_ref(), "c1", TTL).await.unwrap();

    let reader = StreamReader::new(store, Duration::from_secs(3600));
    let events = tokio::time::timeout(
        Duration::from_secs(2),
        reader.events("c1", None).collect::<Vec<ReaderEvent>>(),
    )
    .await
    .unwrap();

    assert_eq!(events.len(), 3);
    assert_eq!(events[2].data, r#"{"status":"cancelled"}"#);
}

#[tokio::test]
async fn test_producer_gone_without_terminal_does_not_hang() {
    let store = Arc::new(MemoryStreamStore::new());
    store.set_with_ttl(TASK, "task-1", TTL).await.unwrap();
    append_contents(store.as_ref(), 1).await;

    let reader = StreamReader::new(store.clone(), Duration::from_millis(50));
    let collector = tokio::spawn(reader.events("c1", None).collect::<Vec<ReaderEvent>>());

    // Producer crashed: marker expired or removed, no terminal written
    tokio::time::sleep(Duration::from_millis(80)).await;
    store.delete(TASK).await.unwrap();

    let events = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event, "complete");
    assert_eq!(events[1].data, r#"{"status":"inactive"}"#);
}
