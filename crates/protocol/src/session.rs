//! Session-facing wire types: CLI vendor kinds, transport variants,
//! lifecycle states, and the full session option catalog carried by
//! `session_start`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which vendor CLI a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliKind {
    Claude,
    Codex,
    Gemini,
}

impl CliKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CliKind::Claude => "claude",
            CliKind::Codex => "codex",
            CliKind::Gemini => "gemini",
        }
    }

    pub const ALL: [CliKind; 3] = [CliKind::Claude, CliKind::Codex, CliKind::Gemini];
}

impl std::fmt::Display for CliKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CliKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(CliKind::Claude),
            "codex" => Ok(CliKind::Codex),
            "gemini" => Ok(CliKind::Gemini),
            other => Err(format!("unknown CLI kind: {other}")),
        }
    }
}

/// How the CLI process is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginVariant {
    /// Bidirectional stream-JSON over piped stdio.
    #[default]
    Sdk,
    /// Attached to a named tmux session.
    Tmux,
    /// One-shot print mode, no interactive protocol.
    Print,
}

/// Lifecycle state of a CLI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Working,
    Waiting,
    Idle,
    Error,
    Offline,
}

/// Tool-permission mode requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
}

/// Extended-thinking level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
    DefaultOn,
}

/// Everything a `session_start` can configure. All fields optional with
/// spec defaults; unknown fields from newer peers are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub resume_session_id: Option<String>,
    pub resume_session_at: Option<String>,
    pub fork_session: bool,
    pub continue_conversation: bool,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub agent: Option<String>,
    pub betas: Vec<String>,
    pub json_schema: Option<Value>,
    pub permission_mode: PermissionMode,
    pub allow_dangerously_skip_permissions: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub tools: Option<Vec<String>>,
    pub mcp_servers: Option<Value>,
    pub setting_sources: Vec<String>,
    pub strict_mcp_config: bool,
    pub additional_directories: Vec<String>,
    pub plugins: Vec<String>,
    pub sandbox: Option<Value>,
    pub persist_session: bool,
    pub max_thinking_tokens: Option<u32>,
    pub include_partial_messages: bool,
    pub thinking_level: Option<ThinkingLevel>,
}
