//! Claude Code transcript store.
//!
//! Layout: `~/.claude/projects/<escaped-path>/` holds one
//! `sessions-index.json` plus one `<sessionId>.jsonl` per session. The
//! escaped directory name is lossy, so the index's `projectPath` field is
//! authoritative whenever it is present.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use ar_domain::{Error, Result};
use ar_protocol::blocks::{Block, Role, StructuredMessage};
use ar_protocol::CliKind;

use crate::escape::{escape_project_path, unescape_lossy};
use crate::normalize::{
    approval_needed_block, epoch, fallback_message, json_summary, message, truncate_text,
    APPROVAL_TAIL_WINDOW, MAX_BLOCK_CHARS,
};
use crate::SessionSummary;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ClaudeStore {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsIndex {
    #[serde(default)]
    project_path: Option<String>,
}

impl ClaudeStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The conventional store location under the user's home.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".claude").join("projects"))
    }

    /// The escaped on-disk directory for a project (for watchers).
    pub fn project_dir(&self, project_path: &str) -> PathBuf {
        self.root.join(escape_project_path(project_path))
    }

    /// All projects with at least one stored session. The index's
    /// `projectPath` wins; inverse unescaping is display-only fallback.
    pub fn list_projects(&self) -> Result<Vec<(String, usize)>> {
        let mut projects = Vec::new();
        if !self.root.is_dir() {
            return Ok(projects);
        }
        for entry in std::fs::read_dir(&self.root).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if !entry.path().is_dir() {
                continue;
            }
            let dir = entry.path();
            let session_count = jsonl_files(&dir).len();
            if session_count == 0 {
                continue;
            }
            let project_path = read_index(&dir)
                .and_then(|index| index.project_path)
                .unwrap_or_else(|| unescape_lossy(&entry.file_name().to_string_lossy()));
            projects.push((project_path, session_count));
        }
        projects.sort();
        Ok(projects)
    }

    /// Sessions of one project, newest data via filesystem mtimes.
    pub fn list_sessions(&self, project_path: &str) -> Result<Vec<SessionSummary>> {
        let dir = self.project_dir(project_path);
        let mut sessions = Vec::new();
        for path in jsonl_files(&dir) {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let updated_at = modified_at(&path).unwrap_or_else(epoch);
            sessions.push(SessionSummary {
                session_id: stem.to_string(),
                kind: CliKind::Claude,
                project_path: project_path.to_string(),
                updated_at,
            });
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    /// Read and normalize one session transcript.
    pub fn read_session(
        &self,
        project_path: &str,
        session_id: &str,
    ) -> Result<Vec<StructuredMessage>> {
        let path = self.project_dir(project_path).join(format!("{session_id}.jsonl"));
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(normalize_jsonl(&raw))
    }
}

fn read_index(dir: &Path) -> Option<SessionsIndex> {
    let raw = std::fs::read_to_string(dir.join("sessions-index.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

fn jsonl_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    files.sort();
    files
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Record schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    is_meta: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistantRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<AssistantPayload>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct AssistantPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Value,
}

enum ClaudeRecord {
    User(UserRecord),
    Assistant(AssistantRecord),
    /// Summaries, file-history snapshots, queue operations: store
    /// bookkeeping, not conversation.
    Noise,
    Other {
        kind: String,
        raw: Value,
    },
}

fn classify(value: Value) -> Option<ClaudeRecord> {
    let kind = value.get("type").and_then(Value::as_str)?.to_string();
    let record = match kind.as_str() {
        "user" => serde_json::from_value::<UserRecord>(value.clone())
            .map(ClaudeRecord::User)
            .unwrap_or(ClaudeRecord::Other {
                kind: kind.clone(),
                raw: value,
            }),
        "assistant" => serde_json::from_value::<AssistantRecord>(value.clone())
            .map(ClaudeRecord::Assistant)
            .unwrap_or(ClaudeRecord::Other {
                kind: kind.clone(),
                raw: value,
            }),
        "summary" | "file-history-snapshot" | "queue-operation" => ClaudeRecord::Noise,
        _ => ClaudeRecord::Other {
            kind: kind.clone(),
            raw: value,
        },
    };
    Some(record)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize raw JSONL text. Malformed lines are skipped individually; a
/// bad line never poisons the rest of the transcript.
pub fn normalize_jsonl(raw: &str) -> Vec<StructuredMessage> {
    let mut records = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                if let Some(record) = classify(value) {
                    records.push(record);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed transcript line");
            }
        }
    }
    normalize_records(&records)
}

struct PendingTool {
    message_index: usize,
    record_index: usize,
    tool_use_id: String,
    tool_name: String,
    input: Value,
}

fn normalize_records(records: &[ClaudeRecord]) -> Vec<StructuredMessage> {
    let mut out: Vec<StructuredMessage> = Vec::new();
    let mut pending: Vec<PendingTool> = Vec::new();
    let mut resolved: HashSet<String> = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        match record {
            ClaudeRecord::User(user) => {
                if user.is_meta {
                    continue;
                }
                let Some(raw) = &user.message else { continue };
                let blocks = user_blocks(&raw.content, &mut resolved);
                if blocks.is_empty() {
                    continue;
                }
                let turn_id = user.uuid.clone().unwrap_or_else(|| format!("t{index}"));
                out.push(message(
                    Role::User,
                    user.timestamp.unwrap_or_else(epoch),
                    &turn_id,
                    "0",
                    blocks,
                ));
            }

            ClaudeRecord::Assistant(assistant) => {
                let Some(payload) = &assistant.message else {
                    continue;
                };
                let turn_id = payload
                    .id
                    .clone()
                    .or_else(|| assistant.uuid.clone())
                    .unwrap_or_else(|| format!("t{index}"));
                let blocks = assistant_blocks(
                    &payload.content,
                    index,
                    out.len(),
                    &mut pending,
                );
                if blocks.is_empty() {
                    continue;
                }
                out.push(message(
                    Role::Assistant,
                    assistant.timestamp.unwrap_or_else(epoch),
                    &turn_id,
                    "0",
                    blocks,
                ));
            }

            ClaudeRecord::Noise => {}

            ClaudeRecord::Other { kind, raw } => {
                let turn_id = format!("t{index}");
                out.push(fallback_message(kind, raw, epoch(), &turn_id, "0"));
            }
        }
    }

    // Unresolved tool uses near the tail signal a session parked on a
    // permission decision; surface that as an approval_needed block.
    let tail_start = records.len().saturating_sub(APPROVAL_TAIL_WINDOW);
    for tool in pending {
        if resolved.contains(&tool.tool_use_id) || tool.record_index < tail_start {
            continue;
        }
        if let Some(msg) = out.get_mut(tool.message_index) {
            msg.content
                .push(approval_needed_block(&tool.tool_name, &tool.input));
        }
    }

    out
}

fn user_blocks(content: &Value, resolved: &mut HashSet<String>) -> Vec<Block> {
    match content {
        Value::String(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Block::Text {
                    text: truncate_text(text, MAX_BLOCK_CHARS),
                }]
            }
        }
        Value::Array(items) => {
            let mut blocks = Vec::new();
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            blocks.push(Block::Text {
                                text: truncate_text(text, MAX_BLOCK_CHARS),
                            });
                        }
                    }
                    Some("tool_result") => {
                        let Some(tool_use_id) =
                            item.get("tool_use_id").and_then(Value::as_str)
                        else {
                            continue;
                        };
                        resolved.insert(tool_use_id.to_string());
                        let text = result_text(item.get("content").unwrap_or(&Value::Null));
                        blocks.push(Block::ToolResult {
                            tool_use_id: tool_use_id.to_string(),
                            is_error: item
                                .get("is_error")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                            content: truncate_text(&text, MAX_BLOCK_CHARS),
                        });
                    }
                    _ => {}
                }
            }
            blocks
        }
        _ => Vec::new(),
    }
}

fn assistant_blocks(
    content: &Value,
    record_index: usize,
    message_index: usize,
    pending: &mut Vec<PendingTool>,
) -> Vec<Block> {
    let Some(items) = content.as_array() else {
        return match content.as_str() {
            Some(text) if !text.is_empty() => vec![Block::Text {
                text: truncate_text(text, MAX_BLOCK_CHARS),
            }],
            _ => Vec::new(),
        };
    };

    let mut blocks = Vec::new();
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    blocks.push(Block::Text {
                        text: truncate_text(text, MAX_BLOCK_CHARS),
                    });
                }
            }
            Some("thinking") => {
                if let Some(text) = item.get("thinking").and_then(Value::as_str) {
                    blocks.push(Block::Thinking {
                        text: truncate_text(text, MAX_BLOCK_CHARS),
                    });
                }
            }
            Some("tool_use") => {
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let input = item.get("input").cloned().unwrap_or(Value::Null);

                if name == "ExitPlanMode" {
                    blocks.push(Block::Plan {
                        text: input
                            .get("plan")
                            .and_then(Value::as_str)
                            .map(|p| truncate_text(p, MAX_BLOCK_CHARS))
                            .unwrap_or_else(|| json_summary(&input)),
                        explanation: input
                            .get("explanation")
                            .and_then(Value::as_str)
                            .map(String::from),
                    });
                } else {
                    blocks.push(Block::ToolUse {
                        name: name.clone(),
                        input: input.clone(),
                        tool_use_id: id.clone(),
                    });
                }
                if !id.is_empty() {
                    pending.push(PendingTool {
                        message_index,
                        record_index,
                        tool_use_id: id,
                        tool_name: name,
                        input,
                    });
                }
            }
            _ => {}
        }
    }
    blocks
}

/// Render tool-result content (string or block array) as plain text.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
