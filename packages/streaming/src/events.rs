// ABOUTME: Agent stream events and the log entry kinds they are published under
// ABOUTME: Events serialize as tagged JSON objects that clients render directly

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind field of a durable log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Content,
    Complete,
    Error,
    QueueInjected,
    QueueProcessing,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::QueueInjected => "queue_injected",
            Self::QueueProcessing => "queue_processing",
        }
    }

    /// Nothing follows `complete` or `error` within one execution attempt
    pub fn is_terminal(kind: &str) -> bool {
        kind == Self::Complete.as_str() || kind == Self::Error.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    /// Enclosing tool call when this one runs inside a sub-agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: ToolStatus,
}

/// One unit of agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AssistantText {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolStarted {
        tool: ToolPayload,
    },
    ToolCompleted {
        tool: ToolPayload,
    },
    ToolFailed {
        tool: ToolPayload,
    },
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default)]
        data: Value,
    },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::AssistantText { text: text.into() }
    }

    pub fn tool(&self) -> Option<&ToolPayload> {
        match self {
            Self::ToolStarted { tool } | Self::ToolCompleted { tool } | Self::ToolFailed { tool } => {
                Some(tool)
            }
            _ => None,
        }
    }

    /// A tool completion outside any sub-agent. Nested completions are excluded
    /// because the enclosing tool call is still waiting on its own result.
    pub fn is_top_level_tool_completion(&self) -> bool {
        match self {
            Self::ToolCompleted { tool } => tool.parent_id.as_deref().map_or(true, str::is_empty),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn completed(parent_id: Option<&str>) -> StreamEvent {
        StreamEvent::ToolCompleted {
            tool: ToolPayload {
                id: "toolu_1".into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
                parent_id: parent_id.map(str::to_string),
                result: Some(json!("ok")),
                error: None,
                status: ToolStatus::Completed,
            },
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let value = serde_json::to_value(completed(None)).unwrap();
        assert_eq!(value["type"], "tool_completed");
        assert_eq!(value["tool"]["name"], "Bash");
        assert!(value["tool"].get("parent_id").is_none());

        let parsed: StreamEvent =
            serde_json::from_value(json!({"type": "assistant_text", "text": "hi"})).unwrap();
        assert_eq!(parsed, StreamEvent::text("hi"));
    }

    #[test]
    fn test_nested_completion_is_not_top_level() {
        assert!(completed(None).is_top_level_tool_completion());
        assert!(completed(Some("")).is_top_level_tool_completion());
        assert!(!completed(Some("toolu_parent")).is_top_level_tool_completion());
        assert!(!StreamEvent::text("done").is_top_level_tool_completion());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(StreamEventKind::is_terminal("complete"));
        assert!(StreamEventKind::is_terminal("error"));
        assert!(!StreamEventKind::is_terminal("content"));
        assert!(!StreamEventKind::is_terminal("queue_processing"));
    }
}
