// ABOUTME: One agent CLI conversation over a sandbox transport
// ABOUTME: Sends user turns, maps CLI JSON messages to StreamEvents, tracks cost and session id

use agentbox_sandbox::{AgentTransport, MessageStream};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StreamingError};
use crate::events::{StreamEvent, ToolPayload, ToolStatus};

/// Where uploaded attachments land inside the sandbox
const ATTACHMENT_DIR: &str = "/home/user";

/// Wrap user content for the agent, listing uploaded files first
pub fn format_user_prompt(content: &str, attachments: Option<&[Value]>) -> String {
    let files: Vec<String> = attachments
        .unwrap_or_default()
        .iter()
        .filter_map(|a| a.get("file_path").and_then(Value::as_str))
        .map(|path| {
            let name = path.rsplit('/').next().unwrap_or(path);
            format!("- {}/{}", ATTACHMENT_DIR, name)
        })
        .collect();

    if files.is_empty() {
        return format!("<user_prompt>{}</user_prompt>", content);
    }
    format!(
        "<user_attachments>\nUser uploaded the following files\n{}\n</user_attachments>\n\n<user_prompt>{}</user_prompt>",
        files.join("\n"),
        content
    )
}

/// Stream-json input line carrying one user turn
pub fn user_message_line(prompt: &str, session_id: Option<&str>) -> String {
    let message = json!({
        "type": "user",
        "message": {"role": "user", "content": prompt},
        "parent_tool_use_id": null,
        "session_id": session_id,
    });
    format!("{}\n", message)
}

/// CLI `--permission-mode` for a chat permission mode
pub fn cli_permission_mode(mode: &str) -> Option<&'static str> {
    match mode {
        "auto" => Some("bypassPermissions"),
        "ask" => Some("default"),
        "plan" => Some("plan"),
        _ => None,
    }
}

/// Thinking budget for a named thinking mode, or a literal token count
pub fn thinking_tokens(mode: &str) -> Option<u32> {
    match mode {
        "low" => Some(4_000),
        "medium" => Some(10_000),
        "high" => Some(16_000),
        "ultra" => Some(32_000),
        other => other.parse().ok(),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct AgentSession {
    transport: Box<dyn AgentTransport>,
    messages: Option<MessageStream>,
    pending: VecDeque<StreamEvent>,
    /// Started tools awaiting their result, by tool use id
    tools: HashMap<String, ToolPayload>,
    total_cost_usd: f64,
    session_id: Option<String>,
    session_update: Option<String>,
    finished: bool,
    closed: bool,
}

impl AgentSession {
    /// Launch the CLI and send the opening user turn
    pub async fn start(
        mut transport: Box<dyn AgentTransport>,
        prompt: &str,
        session_id: Option<String>,
    ) -> Result<Self> {
        transport.connect().await?;
        transport
            .write(&user_message_line(prompt, session_id.as_deref()))
            .await?;
        let messages = transport.read_messages();

        Ok(Self {
            transport,
            messages: Some(messages),
            pending: VecDeque::new(),
            tools: HashMap::new(),
            total_cost_usd: 0.0,
            session_id,
            session_update: None,
            finished: false,
            closed: false,
        })
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Session id announced since the last call, if it changed
    pub fn take_session_update(&mut self) -> Option<String> {
        self.session_update.take()
    }

    /// Next event, `None` once the agent has finished its turn
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            let messages = self.messages.as_mut()?;
            match messages.next().await {
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(message)) => {
                    if let Err(e) = self.handle_message(&message) {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    /// Send another user turn into the running CLI without restarting it
    pub async fn send_user_message(&mut self, prompt: &str) -> Result<()> {
        let line = user_message_line(prompt, self.session_id.as_deref());
        self.transport.write(&line).await?;
        Ok(())
    }

    /// Ask the CLI to stop the turn in progress
    pub async fn interrupt(&mut self) -> Result<()> {
        let request = json!({
            "type": "control_request",
            "request_id": format!("req_{}", Uuid::new_v4().simple()),
            "request": {"subtype": "interrupt"},
        });
        self.transport.write(&format!("{}\n", request)).await?;
        Ok(())
    }

    /// Stop the active stream: interrupt, then tear the transport down
    pub async fn cancel(&mut self) -> Result<()> {
        info!("Cancelling active agent stream");
        if self.transport.is_ready() && !self.closed {
            if let Err(e) = self.interrupt().await {
                debug!("Interrupt during cancel failed: {}", e);
            }
        }
        self.finished = true;
        self.pending.clear();
        self.close().await
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.transport.is_ready() && !self.finished {
            if let Err(e) = self.interrupt().await {
                debug!("Interrupt before close failed: {}", e);
            }
        }
        self.messages = None;
        self.transport.close().await?;
        Ok(())
    }

    fn capture_session(&mut self, message: &Value) {
        if let Some(id) = message.get("session_id").and_then(Value::as_str) {
            if self.session_id.as_deref() != Some(id) {
                debug!("Agent session id is now {}", id);
                self.session_id = Some(id.to_string());
                self.session_update = Some(id.to_string());
            }
        }
    }

    fn handle_message(&mut self, message: &Value) -> Result<()> {
        let parent_id = message
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        match message.get("type").and_then(Value::as_str) {
            Some("system") => {
                let subtype = message.get("subtype").and_then(Value::as_str);
                if subtype == Some("init") {
                    self.capture_session(message);
                } else {
                    self.pending.push_back(StreamEvent::System {
                        subtype: subtype.map(str::to_string),
                        data: message.clone(),
                    });
                }
            }
            Some("assistant") => {
                let blocks = message
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for block in blocks {
                    self.handle_assistant_block(&block, parent_id.clone());
                }
            }
            Some("user") => {
                let blocks = message
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                        self.handle_tool_result(&block, parent_id.clone());
                    }
                }
            }
            Some("result") => {
                self.capture_session(message);
                if let Some(cost) = message.get("total_cost_usd").and_then(Value::as_f64) {
                    self.total_cost_usd = cost;
                }
                self.finished = true;
                if message.get("is_error").and_then(Value::as_bool) == Some(true) {
                    let reason = message
                        .get("result")
                        .and_then(Value::as_str)
                        .or_else(|| message.get("subtype").and_then(Value::as_str))
                        .unwrap_or("agent reported an error");
                    return Err(StreamingError::Agent(reason.to_string()));
                }
            }
            other => debug!("Ignoring agent message of type {:?}", other),
        }
        Ok(())
    }

    fn handle_assistant_block(&mut self, block: &Value, parent_id: Option<String>) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                if !text.is_empty() {
                    self.pending.push_back(StreamEvent::text(text));
                }
            }
            Some("thinking") => {
                let thinking = block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !thinking.is_empty() {
                    self.pending.push_back(StreamEvent::Thinking {
                        thinking: thinking.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let tool = ToolPayload {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                    parent_id,
                    result: None,
                    error: None,
                    status: ToolStatus::Started,
                };
                self.tools.insert(tool.id.clone(), tool.clone());
                self.pending.push_back(StreamEvent::ToolStarted { tool });
            }
            other => debug!("Ignoring assistant block of type {:?}", other),
        }
    }

    fn handle_tool_result(&mut self, block: &Value, parent_id: Option<String>) {
        let tool_use_id = block
            .get("tool_use_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let content = block.get("content").cloned().unwrap_or(Value::Null);
        let failed = block.get("is_error").and_then(Value::as_bool) == Some(true);

        let mut tool = self.tools.remove(tool_use_id).unwrap_or_else(|| {
            warn!("Tool result for unknown tool use {}", tool_use_id);
            ToolPayload {
                id: tool_use_id.to_string(),
                name: "unknown".to_string(),
                input: Value::Null,
                parent_id,
                result: None,
                error: None,
                status: ToolStatus::Started,
            }
        });

        if failed {
            tool.status = ToolStatus::Failed;
            tool.error = Some(tool_result_text(&content));
            self.pending.push_back(StreamEvent::ToolFailed { tool });
        } else {
            tool.status = ToolStatus::Completed;
            tool.result = Some(content);
            self.pending.push_back(StreamEvent::ToolCompleted { tool });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prompt_without_attachments() {
        assert_eq!(
            format_user_prompt("hello", None),
            "<user_prompt>hello</user_prompt>"
        );
        assert_eq!(
            format_user_prompt("hello", Some(&[])),
            "<user_prompt>hello</user_prompt>"
        );
    }

    #[test]
    fn test_prompt_lists_attachment_basenames() {
        let attachments = vec![
            json!({"file_path": "uploads/u1/report.pdf"}),
            json!({"file_path": "logo.png"}),
        ];
        assert_eq!(
            format_user_prompt("summarize", Some(&attachments)),
            "<user_attachments>\nUser uploaded the following files\n- /home/user/report.pdf\n- /home/user/logo.png\n</user_attachments>\n\n<user_prompt>summarize</user_prompt>"
        );
    }

    #[test]
    fn test_user_message_line_shape() {
        let line = user_message_line("<user_prompt>x</user_prompt>", Some("s-1"));
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"], "<user_prompt>x</user_prompt>");
        assert!(value["parent_tool_use_id"].is_null());
        assert_eq!(value["session_id"], "s-1");
    }

    #[test]
    fn test_mode_mappings() {
        assert_eq!(cli_permission_mode("auto"), Some("bypassPermissions"));
        assert_eq!(cli_permission_mode("plan"), Some("plan"));
        assert_eq!(cli_permission_mode("yolo"), None);
        assert_eq!(thinking_tokens("ultra"), Some(32_000));
        assert_eq!(thinking_tokens("2048"), Some(2048));
        assert_eq!(thinking_tokens("lots"), None);
    }
}
