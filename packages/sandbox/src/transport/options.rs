// ABOUTME: Structured options for one agent CLI invocation
// ABOUTME: Deterministically rendered into the CLI command line; unset options omit their flag

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

use agentbox_config::defaults;

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, PartialEq)]
pub enum SystemPrompt {
    /// Replace the CLI's system prompt entirely
    Text(String),
    /// Keep the CLI's preset prompt, optionally appending text
    Preset { append: Option<String> },
}

/// Sub-agent definition passed through `--agents`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// CLI binary; `claude` when unset
    pub cli_path: Option<String>,
    pub system_prompt: Option<SystemPrompt>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub disallowed_tools: Vec<String>,
    pub model: Option<String>,
    pub permission_prompt_tool_name: Option<String>,
    pub permission_mode: Option<String>,
    pub continue_conversation: bool,
    pub resume: Option<String>,
    pub settings: Option<String>,
    pub add_dirs: Vec<String>,
    /// Server name -> config. In-process (`"type": "sdk"`) servers lose their `instance` key.
    pub mcp_servers: BTreeMap<String, Value>,
    pub include_partial_messages: bool,
    pub fork_session: bool,
    pub max_thinking_tokens: Option<u32>,
    pub agents: BTreeMap<String, AgentDefinition>,
    pub setting_sources: Option<Vec<String>>,
    /// Extra `--flag [value]` pairs appended verbatim
    pub extra_args: BTreeMap<String, Option<String>>,

    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub max_buffer_size: Option<usize>,
    /// Receives decoded stderr text; stderr is only logged when unset
    pub stderr: Option<mpsc::UnboundedSender<String>>,
}

impl AgentOptions {
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
            .unwrap_or(defaults::CLI_MAX_BUFFER_BYTES)
    }

    /// CLI argument vector. Pure function of the options.
    pub fn build_args(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            self.cli_path
                .clone()
                .unwrap_or_else(|| defaults::CLI_PATH.to_string()),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];

        match &self.system_prompt {
            Some(SystemPrompt::Text(text)) => {
                args.extend(["--system-prompt".into(), text.clone()]);
            }
            Some(SystemPrompt::Preset {
                append: Some(append),
            }) => {
                args.extend(["--append-system-prompt".into(), append.clone()]);
            }
            Some(SystemPrompt::Preset { append: None }) | None => {}
        }

        if !self.allowed_tools.is_empty() {
            args.extend(["--allowedTools".into(), self.allowed_tools.join(",")]);
        }
        if let Some(turns) = self.max_turns {
            args.extend(["--max-turns".into(), turns.to_string()]);
        }
        if !self.disallowed_tools.is_empty() {
            args.extend(["--disallowedTools".into(), self.disallowed_tools.join(",")]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".into(), model.clone()]);
        }
        if let Some(tool) = &self.permission_prompt_tool_name {
            args.extend(["--permission-prompt-tool".into(), tool.clone()]);
        }
        if let Some(mode) = &self.permission_mode {
            args.extend(["--permission-mode".into(), mode.clone()]);
        }
        if self.continue_conversation {
            args.push("--continue".into());
        }
        if let Some(resume) = &self.resume {
            args.extend(["--resume".into(), resume.clone()]);
        }
        if let Some(settings) = &self.settings {
            args.extend(["--settings".into(), settings.clone()]);
        }
        for dir in &self.add_dirs {
            args.extend(["--add-dir".into(), dir.clone()]);
        }
        if !self.mcp_servers.is_empty() {
            let servers: Map<String, Value> = self
                .mcp_servers
                .iter()
                .map(|(name, config)| (name.clone(), cli_mcp_config(config)))
                .collect();
            args.extend([
                "--mcp-config".into(),
                serde_json::to_string(&json!({ "mcpServers": servers }))?,
            ]);
        }
        if self.include_partial_messages {
            args.push("--include-partial-messages".into());
        }
        if self.fork_session {
            args.push("--fork-session".into());
        }
        if let Some(tokens) = self.max_thinking_tokens {
            args.extend(["--max-thinking-tokens".into(), tokens.to_string()]);
        }
        if !self.agents.is_empty() {
            args.extend(["--agents".into(), serde_json::to_string(&self.agents)?]);
        }
        if let Some(sources) = &self.setting_sources {
            args.extend(["--setting-sources".into(), sources.join(",")]);
        }
        for (flag, value) in &self.extra_args {
            args.push(format!("--{}", flag));
            if let Some(value) = value {
                args.push(value.clone());
            }
        }

        args.extend(["--input-format".into(), "stream-json".into()]);
        Ok(args)
    }

    /// Shell-quoted command line for `bash -c "exec ..."`
    pub fn command_line(&self) -> Result<String> {
        let args = self.build_args()?;
        shlex::try_join(args.iter().map(String::as_str)).map_err(|e| {
            SandboxError::InvalidConfiguration(format!("Cannot quote CLI arguments: {}", e))
        })
    }

    /// Environment for the CLI process: transport defaults overlaid by caller-supplied values
    pub fn process_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("CLAUDE_CODE_ENTRYPOINT".to_string(), "sdk-rs".to_string()),
            ("CLAUDE_CODE_SANDBOX".to_string(), "1".to_string()),
            ("AGENTBOX_VERSION".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ]);
        env.extend(self.env.clone());
        env.insert("TERM".to_string(), crate::helpers::TERMINAL_TYPE.to_string());
        env
    }

    pub fn working_dir(&self) -> String {
        self.cwd
            .clone()
            .unwrap_or_else(|| crate::helpers::SANDBOX_HOME.to_string())
    }

    pub fn run_as(&self) -> String {
        self.user.clone().unwrap_or_else(|| "user".to_string())
    }
}

fn cli_mcp_config(config: &Value) -> Value {
    match config {
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("sdk") => {
            let mut stripped = map.clone();
            stripped.remove("instance");
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}
