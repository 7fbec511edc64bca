//! Codex transcript access.
//!
//! The Codex store is opaque: no on-disk layout is documented, only the
//! vendor CLI's thread API (cursor-paginated listing plus a per-thread
//! read). [`CodexApi`] is the seam; [`CodexCliApi`] shells out to the
//! `codex` binary, tests substitute an in-memory fake. Listings omit
//! turns, so hydration always needs the second call.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use ar_domain::{Error, Result};
use ar_protocol::blocks::{Block, Role, StructuredMessage};

use crate::normalize::{
    epoch, json_summary, message, truncate_text, MAX_BLOCK_CHARS,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// API seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    #[serde(default)]
    pub threads: Vec<ThreadSummary>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexThread {
    pub id: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: Vec<CodexTurn>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexTurn {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Access to the opaque Codex thread store.
#[async_trait]
pub trait CodexApi: Send + Sync {
    async fn list_threads(&self, cursor: Option<String>) -> Result<ThreadPage>;
    async fn read_thread(&self, thread_id: &str) -> Result<CodexThread>;
}

/// Pagination guard: no sane store needs more pages than this.
const MAX_PAGES: usize = 64;

/// Walk the cursor pagination to a full thread listing.
pub async fn list_all_threads(api: &dyn CodexApi) -> Result<Vec<ThreadSummary>> {
    let mut threads = Vec::new();
    let mut cursor = None;
    for _ in 0..MAX_PAGES {
        let page = api.list_threads(cursor.take()).await?;
        threads.extend(page.threads);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(threads),
        }
    }
    tracing::warn!(pages = MAX_PAGES, "codex thread listing did not terminate, truncating");
    Ok(threads)
}

/// Group a listing by project path (threads without one are skipped).
pub fn threads_by_project(threads: &[ThreadSummary]) -> BTreeMap<String, Vec<ThreadSummary>> {
    let mut by_project: BTreeMap<String, Vec<ThreadSummary>> = BTreeMap::new();
    for thread in threads {
        if let Some(project) = &thread.project_path {
            by_project
                .entry(project.clone())
                .or_default()
                .push(thread.clone());
        }
    }
    by_project
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI-backed implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Talks to the `codex` binary. Every call is a short-lived subprocess;
/// the CLI owns caching and authentication.
pub struct CodexCliApi {
    binary: PathBuf,
}

impl CodexCliApi {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(Error::Io)?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "codex {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl CodexApi for CodexCliApi {
    async fn list_threads(&self, cursor: Option<String>) -> Result<ThreadPage> {
        let mut args = vec!["threads", "list", "--json"];
        if let Some(cursor) = &cursor {
            args.push("--cursor");
            args.push(cursor);
        }
        let stdout = self.run(&args).await?;
        serde_json::from_slice(&stdout).map_err(Error::Json)
    }

    async fn read_thread(&self, thread_id: &str) -> Result<CodexThread> {
        let stdout = self
            .run(&["threads", "show", thread_id, "--json"])
            .await?;
        serde_json::from_slice(&stdout).map_err(Error::Json)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize one hydrated thread into the canonical schema.
pub fn normalize_thread(thread: &CodexThread) -> Vec<StructuredMessage> {
    let mut out = Vec::new();
    for turn in &thread.turns {
        let role = match turn.role.as_deref() {
            Some("user") => Role::User,
            _ => Role::Assistant,
        };
        for (item_index, item) in turn.items.iter().enumerate() {
            let item_id = item_index.to_string();
            let blocks = item_blocks(&turn.id, item_index, item);
            if blocks.is_empty() {
                continue;
            }
            out.push(message(role, turn.created_at, &turn.id, &item_id, blocks));
        }
    }
    out
}

fn item_blocks(turn_id: &str, item_index: usize, item: &Value) -> Vec<Block> {
    let kind = item.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "message" => text_of(item, "text")
            .map(|text| {
                vec![Block::Text {
                    text: truncate_text(&text, MAX_BLOCK_CHARS),
                }]
            })
            .unwrap_or_default(),

        "reasoning" => text_of(item, "text")
            .map(|text| {
                vec![Block::Thinking {
                    text: truncate_text(&text, MAX_BLOCK_CHARS),
                }]
            })
            .unwrap_or_default(),

        "command_execution" => {
            // One item carries both the call and its output; emit the
            // pair with a synthetic id so downstream pairing holds.
            let tool_use_id = format!("call_{turn_id}_{item_index}");
            let command = item
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let exit_code = item.get("exit_code").and_then(Value::as_i64);
            let output = item
                .get("aggregated_output")
                .and_then(Value::as_str)
                .unwrap_or_default();
            vec![
                Block::ToolUse {
                    name: "shell".into(),
                    input: serde_json::json!({"command": command}),
                    tool_use_id: tool_use_id.clone(),
                },
                Block::ToolResult {
                    tool_use_id,
                    is_error: exit_code.is_some_and(|code| code != 0),
                    content: truncate_text(output, MAX_BLOCK_CHARS),
                },
            ]
        }

        "file_change" => {
            let tool_use_id = format!("call_{turn_id}_{item_index}");
            vec![Block::ToolUse {
                name: "apply_patch".into(),
                input: item.clone(),
                tool_use_id,
            }]
        }

        "" => Vec::new(),

        other => vec![Block::Text {
            text: format!("[{other}] {}", json_summary(item)),
        }],
    }
}

fn text_of(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory [`CodexApi`] for tests: pages and threads are fixed up
    /// front, calls are counted.
    pub struct FakeCodexApi {
        pub pages: Vec<ThreadPage>,
        pub threads: Vec<CodexThread>,
        pub list_calls: Mutex<usize>,
    }

    #[async_trait]
    impl CodexApi for FakeCodexApi {
        async fn list_threads(&self, cursor: Option<String>) -> Result<ThreadPage> {
            let mut calls = self.list_calls.lock();
            let index = cursor
                .as_deref()
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            *calls += 1;
            self.pages
                .get(index)
                .cloned()
                .ok_or_else(|| Error::Other(format!("no page {index}")))
        }

        async fn read_thread(&self, thread_id: &str) -> Result<CodexThread> {
            self.threads
                .iter()
                .find(|t| t.id == thread_id)
                .cloned()
                .ok_or_else(|| Error::Other(format!("no thread {thread_id}")))
        }
    }
}
