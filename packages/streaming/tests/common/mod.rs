// ABOUTME: Shared fixtures for streaming integration tests
// ABOUTME: Scripted agent transport, in-memory database, and agent CLI message builders

#![allow(dead_code)]

use agentbox_sandbox::{AgentTransport, MessageStream, SandboxError};
use agentbox_streaming::{
    open_pool, Chat, LogEntry, Message, MessageStore, NewMessage, SqliteMessageStore, StreamStore,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Scripted = Result<Value, SandboxError>;

/// Agent transport fed from the test through a [`ScriptHandle`]
pub struct ScriptedTransport {
    rx: Option<mpsc::UnboundedReceiver<Scripted>>,
    writes: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    ready: bool,
}

#[derive(Clone)]
pub struct ScriptHandle {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Scripted>>>>,
    writes: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx: Some(rx),
                writes: writes.clone(),
                closed: closed.clone(),
                ready: false,
            },
            ScriptHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
                writes,
                closed,
            },
        )
    }

    /// Transport whose whole output is known up front
    pub fn with_messages(messages: Vec<Value>) -> (Self, ScriptHandle) {
        let (transport, handle) = Self::new();
        for message in messages {
            handle.send(message);
        }
        handle.finish();
        (transport, handle)
    }
}

impl ScriptHandle {
    pub fn send(&self, message: Value) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(message));
        }
    }

    pub fn fail(&self, error: SandboxError) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the output stream
    pub fn finish(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    /// Parsed stdin lines of type `user`
    pub fn user_turns(&self) -> Vec<Value> {
        self.writes()
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .filter(|line| line["type"] == "user")
            .collect()
    }

    pub fn interrupts(&self) -> usize {
        self.writes()
            .iter()
            .filter(|line| line.contains("\"interrupt\""))
            .count()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn connect(&mut self) -> agentbox_sandbox::Result<()> {
        self.ready = true;
        Ok(())
    }

    async fn write(&mut self, data: &str) -> agentbox_sandbox::Result<()> {
        if !self.ready {
            return Err(SandboxError::CliConnection("transport is not ready".into()));
        }
        self.writes.lock().unwrap().push(data.to_string());
        Ok(())
    }

    async fn end_input(&mut self) -> agentbox_sandbox::Result<()> {
        Ok(())
    }

    fn read_messages(&mut self) -> MessageStream {
        match self.rx.take() {
            Some(rx) => Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|message| (message, rx))
            })),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn close(&mut self) -> agentbox_sandbox::Result<()> {
        self.ready = false;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

// ==================== Agent CLI messages ====================

pub fn init(session_id: &str) -> Value {
    json!({"type": "system", "subtype": "init", "session_id": session_id})
}

pub fn text(text: &str) -> Value {
    json!({
        "type": "assistant",
        "parent_tool_use_id": null,
        "message": {"content": [{"type": "text", "text": text}]}
    })
}

pub fn tool_use(id: &str, name: &str, parent: Option<&str>) -> Value {
    json!({
        "type": "assistant",
        "parent_tool_use_id": parent,
        "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": {}}]}
    })
}

pub fn tool_result(id: &str, parent: Option<&str>) -> Value {
    json!({
        "type": "user",
        "parent_tool_use_id": parent,
        "message": {"content": [{"type": "tool_result", "tool_use_id": id, "content": "ok"}]}
    })
}

pub fn result(cost: f64) -> Value {
    json!({"type": "result", "subtype": "success", "total_cost_usd": cost, "is_error": false})
}

pub fn error_result(reason: &str) -> Value {
    json!({"type": "result", "subtype": "error_during_execution", "is_error": true, "result": reason})
}

// ==================== Persistence ====================

pub async fn message_store() -> Arc<SqliteMessageStore> {
    let pool = open_pool("sqlite::memory:").await.unwrap();
    Arc::new(SqliteMessageStore::new(pool))
}

/// A chat with one user message and the pending assistant row for its reply
pub async fn seeded_chat(
    messages: &dyn MessageStore,
    sandbox_id: Option<&str>,
) -> (Chat, Message) {
    let chat = messages
        .create_chat("user-1", "Test chat", sandbox_id)
        .await
        .unwrap();
    messages
        .create_message(&chat.id, NewMessage::user("hello", None))
        .await
        .unwrap();
    let assistant = messages
        .create_message(&chat.id, NewMessage::pending_assistant("sonnet"))
        .await
        .unwrap();
    (chat, assistant)
}

pub async fn log_entries(store: &dyn StreamStore, chat_id: &str) -> Vec<LogEntry> {
    store
        .read_after(&format!("chat:{}:stream", chat_id), None, None)
        .await
        .unwrap()
}

pub fn kinds(entries: &[LogEntry]) -> Vec<String> {
    entries.iter().map(|entry| entry.kind.clone()).collect()
}

/// Poll until the chat's log holds at least `count` entries
pub async fn wait_for_entries(store: &dyn StreamStore, chat_id: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while log_entries(store, chat_id).await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("log did not reach the expected length");
}
