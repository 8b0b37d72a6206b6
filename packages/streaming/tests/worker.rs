// ABOUTME: End-to-end chat worker tests on the local sandbox provider
// ABOUTME: A bash script stands in for the agent CLI; covers markers, status, checkpoints, and queue hand-off

mod common;

use agentbox_sandbox::{LocalConfig, LocalProvider, SandboxProvider};
use agentbox_streaming::{
    stream_status, ChatRequest, ChatWorker, MemoryStreamStore, MessageStore, MessageStreamStatus,
    QueueService, QueueSubmission, StreamReader, StreamStore, StreamingConfig, StreamingError,
    TaskLiveness, WorkerDeps,
};
use common::*;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

/// Agent CLI stand-in: waits `delay` seconds, answers one turn, and exits
fn fake_cli(dir: &std::path::Path, delay: &str) -> String {
    let path = dir.join("fake-agent");
    let script = format!(
        r#"#!/usr/bin/env bash
IFS= read -r line
sleep {delay}
echo '{{"type":"system","subtype":"init","session_id":"sess-w"}}'
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"hello from the sandbox"}}]}}}}'
echo '{{"type":"result","subtype":"success","total_cost_usd":0.05,"is_error":false}}'
"#
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

struct Setup {
    _root: tempfile::TempDir,
    _bin: tempfile::TempDir,
    store: Arc<MemoryStreamStore>,
    messages: Arc<agentbox_streaming::SqliteMessageStore>,
    worker: Arc<ChatWorker>,
    chat_id: String,
    assistant_id: String,
}

async fn setup(delay: &str) -> Setup {
    let root = tempfile::Builder::new()
        .prefix("agentbox-worker")
        .tempdir()
        .unwrap();
    let bin = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(LocalConfig::new(root.path())));
    let sandbox_id = provider.create().await.unwrap();

    let store = Arc::new(MemoryStreamStore::new());
    let messages = message_store().await;
    let (chat, assistant) = seeded_chat(messages.as_ref(), Some(&sandbox_id)).await;

    let config = StreamingConfig {
        cli_path: fake_cli(bin.path(), delay),
        live_poll_interval: Duration::from_millis(100),
        ..StreamingConfig::default()
    };
    let worker = ChatWorker::new(WorkerDeps {
        store: store.clone(),
        messages: messages.clone(),
        sandbox: provider,
        config,
    });

    Setup {
        _root: root,
        _bin: bin,
        store,
        messages,
        worker,
        chat_id: chat.id,
        assistant_id: assistant.id,
    }
}

fn request(s: &Setup) -> ChatRequest {
    ChatRequest {
        chat_id: s.chat_id.clone(),
        prompt: "say hello".to_string(),
        model_id: "sonnet".to_string(),
        permission_mode: "auto".to_string(),
        thinking_mode: None,
        attachments: None,
        assistant_message_id: Some(s.assistant_id.clone()),
        session_id: None,
        system_prompt: None,
        is_queue_continuation: false,
    }
}

#[tokio::test]
async fn test_turn_runs_to_completion_and_checkpoints() {
    let s = setup("0").await;
    let task_id = s.worker.dispatch(request(&s)).await.unwrap();
    assert!(!task_id.is_empty());

    let reader = StreamReader::new(s.store.clone(), Duration::from_millis(100));
    let events: Vec<_> = tokio::time::timeout(
        Duration::from_secs(20),
        reader.events(s.chat_id.clone(), None).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(kinds, vec!["content", "complete"]);
    assert!(events[0].data.contains("hello from the sandbox"));

    assert!(s.worker.wait_idle(&s.chat_id, Duration::from_secs(10)).await);
    let message = s
        .messages
        .get_message(&s.assistant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.stream_status, Some(MessageStreamStatus::Completed));
    assert_eq!(message.total_cost_usd, 0.05);
    assert!(message.checkpoint_id.is_some());

    let chat = s.messages.get_chat(&s.chat_id).await.unwrap().unwrap();
    assert_eq!(chat.session_id.as_deref(), Some("sess-w"));

    let status = stream_status(s.store.as_ref(), s.messages.as_ref(), None, &s.chat_id)
        .await
        .unwrap();
    assert!(!status.has_active_task);
}

#[tokio::test]
async fn test_second_dispatch_is_refused_while_active() {
    let s = setup("1").await;
    s.worker.dispatch(request(&s)).await.unwrap();

    let err = s.worker.dispatch(request(&s)).await.unwrap_err();
    assert!(matches!(err, StreamingError::AlreadyActive(_)));

    let status = stream_status(
        s.store.as_ref(),
        s.messages.as_ref(),
        Some(s.worker.as_ref() as &dyn TaskLiveness),
        &s.chat_id,
    )
    .await
    .unwrap();
    assert!(status.has_active_task);
    assert_eq!(status.message_id.as_deref(), Some(s.assistant_id.as_str()));

    assert!(s.worker.wait_idle(&s.chat_id, Duration::from_secs(20)).await);
    assert!(s
        .store
        .get(&format!("chat:{}:task", s.chat_id))
        .await
        .unwrap()
        .is_none());

    // Free again once the turn is over
    let mut next = request(&s);
    next.assistant_message_id = None;
    s.worker.dispatch(next).await.unwrap();
    assert!(s.worker.wait_idle(&s.chat_id, Duration::from_secs(20)).await);
}

#[tokio::test]
async fn test_message_queued_mid_turn_runs_as_continuation() {
    let s = setup("1").await;
    s.worker.dispatch(request(&s)).await.unwrap();

    let queue = QueueService::new(s.store.clone(), Duration::from_secs(3600));
    queue
        .upsert_message(
            &s.chat_id,
            QueueSubmission {
                content: "and then say goodbye".into(),
                model_id: "sonnet".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let reader = StreamReader::new(s.store.clone(), Duration::from_millis(100));
    let events: Vec<_> = tokio::time::timeout(
        Duration::from_secs(30),
        reader.events(s.chat_id.clone(), None).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(kinds, vec!["content", "queue_processing", "content", "complete"]);

    assert!(s.worker.wait_idle(&s.chat_id, Duration::from_secs(20)).await);
    let all = s.messages.list_messages(&s.chat_id).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[2].content, "and then say goodbye");
    assert_eq!(all[3].stream_status, Some(MessageStreamStatus::Completed));
    assert!(!queue.has_messages(&s.chat_id).await.unwrap());
}

#[tokio::test]
async fn test_missing_sandbox_fails_the_turn() {
    let s = setup("0").await;
    s.messages.set_chat_sandbox(&s.chat_id, "gone").await.unwrap();
    s.worker.dispatch(request(&s)).await.unwrap();

    assert!(s.worker.wait_idle(&s.chat_id, Duration::from_secs(10)).await);
    let entries = log_entries(s.store.as_ref(), &s.chat_id).await;
    assert_eq!(kinds(&entries), vec!["error"]);

    let message = s
        .messages
        .get_message(&s.assistant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.stream_status, Some(MessageStreamStatus::Failed));
}

#[tokio::test]
async fn test_shutdown_interrupts_running_turns() {
    let s = setup("5").await;
    s.worker.dispatch(request(&s)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(10), s.worker.shutdown())
        .await
        .unwrap();
    assert!(!s.worker.is_running(&s.chat_id));

    let entries = log_entries(s.store.as_ref(), &s.chat_id).await;
    assert_eq!(kinds(&entries), vec!["complete"]);
    let message = s
        .messages
        .get_message(&s.assistant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.stream_status, Some(MessageStreamStatus::Interrupted));
}
