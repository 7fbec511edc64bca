//! Gemini CLI transcripts.
//!
//! Gemini keeps its chats under the project root itself:
//! `<project>/.gemini/chats/<sessionId>.json`, one JSON document per
//! session with a `messages` array. Files that don't parse are skipped.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use ar_domain::{Error, Result};
use ar_protocol::blocks::{Block, Role, StructuredMessage};
use ar_protocol::CliKind;

use crate::normalize::{epoch, json_summary, message, truncate_text, MAX_BLOCK_CHARS};
use crate::SessionSummary;

#[derive(Debug, Clone)]
pub struct GeminiStore;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChat {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    messages: Vec<GeminiMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl GeminiStore {
    pub fn new() -> Self {
        Self
    }

    fn chats_dir(project_path: &Path) -> PathBuf {
        project_path.join(".gemini").join("chats")
    }

    /// Whether a project has any Gemini chats at all.
    pub fn has_sessions(&self, project_path: &Path) -> bool {
        Self::chats_dir(project_path).is_dir()
    }

    pub fn list_sessions(&self, project_path: &Path) -> Result<Vec<SessionSummary>> {
        let dir = Self::chats_dir(project_path);
        let mut sessions = Vec::new();
        if !dir.is_dir() {
            return Ok(sessions);
        }
        for entry in std::fs::read_dir(&dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let updated_at = std::fs::metadata(&path)
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(epoch);
            sessions.push(SessionSummary {
                session_id: stem.to_string(),
                kind: CliKind::Gemini,
                project_path: project_path.to_string_lossy().into_owned(),
                updated_at,
            });
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    pub fn read_session(
        &self,
        project_path: &Path,
        session_id: &str,
    ) -> Result<Vec<StructuredMessage>> {
        let path = Self::chats_dir(project_path).join(format!("{session_id}.json"));
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let chat: GeminiChat = serde_json::from_str(&raw).map_err(Error::Json)?;
        Ok(normalize_chat(session_id, &chat))
    }
}

impl Default for GeminiStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_chat(session_id: &str, chat: &GeminiChat) -> Vec<StructuredMessage> {
    let turn_seed = chat.session_id.as_deref().unwrap_or(session_id);
    let mut out = Vec::new();
    for (index, msg) in chat.messages.iter().enumerate() {
        let role = match msg.role.as_deref() {
            Some("model") | Some("assistant") => Role::Assistant,
            _ => Role::User,
        };
        let blocks = content_blocks(&msg.content);
        if blocks.is_empty() {
            continue;
        }
        let turn_id = msg
            .id
            .clone()
            .unwrap_or_else(|| format!("{turn_seed}-{index}"));
        out.push(message(
            role,
            msg.timestamp.unwrap_or_else(epoch),
            &turn_id,
            "0",
            blocks,
        ));
    }
    out
}

fn content_blocks(content: &Value) -> Vec<Block> {
    match content {
        Value::String(text) if !text.is_empty() => vec![Block::Text {
            text: truncate_text(text, MAX_BLOCK_CHARS),
        }],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    Some(Block::Text {
                        text: truncate_text(text, MAX_BLOCK_CHARS),
                    })
                } else if let Some(call) = part.get("functionCall") {
                    Some(Block::ToolUse {
                        name: call
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("function")
                            .to_string(),
                        input: call.get("args").cloned().unwrap_or(Value::Null),
                        tool_use_id: call
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                } else if !part.is_null() {
                    Some(Block::Text {
                        text: json_summary(part),
                    })
                } else {
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_chat(project: &Path, session_id: &str, chat: Value) {
        let dir = project.join(".gemini").join("chats");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{session_id}.json")), chat.to_string()).unwrap();
    }

    #[test]
    fn lists_and_reads_project_chats() {
        let dir = tempfile::tempdir().unwrap();
        write_chat(
            dir.path(),
            "chat-1",
            serde_json::json!({
                "sessionId": "chat-1",
                "messages": [
                    {"role": "user", "content": "hello", "timestamp": "2026-02-01T08:00:00Z"},
                    {"role": "model", "content": [{"text": "hi there"}]},
                ],
            }),
        );

        let store = GeminiStore::new();
        assert!(store.has_sessions(dir.path()));

        let sessions = store.list_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].kind, CliKind::Gemini);

        let messages = store.read_session(dir.path(), "chat-1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[0].id, "chat-1-0:0:0");
    }

    #[test]
    fn function_calls_become_tool_use_blocks() {
        let chat: GeminiChat = serde_json::from_value(serde_json::json!({
            "messages": [{
                "role": "model",
                "content": [{"functionCall": {"id": "fc1", "name": "run_shell", "args": {"cmd": "ls"}}}],
            }],
        }))
        .unwrap();
        let messages = normalize_chat("s", &chat);
        match &messages[0].content[0] {
            Block::ToolUse {
                name,
                input,
                tool_use_id,
            } => {
                assert_eq!(name, "run_shell");
                assert_eq!(input["cmd"], "ls");
                assert_eq!(tool_use_id, "fc1");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn projects_without_chats_are_empty_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = GeminiStore::new();
        assert!(!store.has_sessions(dir.path()));
        assert!(store.list_sessions(dir.path()).unwrap().is_empty());
    }
}
