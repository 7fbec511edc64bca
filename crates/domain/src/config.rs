//! Runner and gateway configuration, loaded from TOML.
//!
//! Every field has a serde default so a minimal file (or none at all, for
//! the gateway in dev mode) still produces a usable config. `validate()`
//! collects issues with severities; the binaries print warnings and abort
//! on errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ar_protocol::CliKind;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn warn(message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Warning,
        message: message.into(),
    }
}

fn error(message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        message: message.into(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Gateway WebSocket URL, e.g. `ws://gateway:8787/ws`.
    pub bot_ws_url: String,
    /// Pre-shared registration token. Falls back to `AGENTRELAY_TOKEN`.
    pub token: String,
    pub runner_name: String,
    /// Local health endpoint port. `0` disables the listener.
    pub http_port: u16,
    pub default_workspace: PathBuf,
    /// CLI vendors this runner can host.
    pub cli_kinds: Vec<CliKind>,
    /// Extra directories searched for CLI binaries, before `$PATH`.
    pub cli_search_paths: Vec<PathBuf>,
    /// Additional project directories the sync service watches.
    pub watch_projects: Vec<PathBuf>,
    pub approval_timeout_ms: u64,
    pub control_timeout_ms: u64,
    pub mcp_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_sync_chunk_bytes: usize,
    pub codex_poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bot_ws_url: "ws://127.0.0.1:8787/ws".into(),
            token: String::new(),
            runner_name: hostname_or("runner"),
            http_port: 8788,
            default_workspace: PathBuf::from("."),
            cli_kinds: vec![CliKind::Claude],
            cli_search_paths: Vec::new(),
            watch_projects: Vec::new(),
            approval_timeout_ms: 30_000,
            control_timeout_ms: 5_000,
            mcp_timeout_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            max_sync_chunk_bytes: ar_protocol::MAX_SYNC_CHUNK_BYTES,
            codex_poll_interval_ms: 15_000,
        }
    }
}

impl RunnerConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let mut config: RunnerConfig =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for secrets that shouldn't live in the file.
    pub fn apply_env(&mut self) {
        if self.token.is_empty() {
            if let Ok(token) = std::env::var("AGENTRELAY_TOKEN") {
                self.token = token;
            }
        }
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.token.is_empty() {
            issues.push(error(
                "runner token is empty (set `token` or AGENTRELAY_TOKEN)",
            ));
        }
        if !self.bot_ws_url.starts_with("ws://") && !self.bot_ws_url.starts_with("wss://") {
            issues.push(error(format!(
                "bot_ws_url must be a ws:// or wss:// URL, got {}",
                self.bot_ws_url
            )));
        }
        if self.cli_kinds.is_empty() {
            issues.push(error("cli_kinds is empty, nothing to host"));
        }
        if !self.default_workspace.exists() {
            issues.push(warn(format!(
                "default workspace {} does not exist yet",
                self.default_workspace.display()
            )));
        }
        if self.approval_timeout_ms < 5_000 {
            issues.push(warn(format!(
                "approval_timeout_ms of {} is shorter than most humans take to click",
                self.approval_timeout_ms
            )));
        }
        if self.max_sync_chunk_bytes < 64 * 1024 {
            issues.push(warn(format!(
                "max_sync_chunk_bytes of {} will produce very chatty syncs",
                self.max_sync_chunk_bytes
            )));
        }
        for path in &self.cli_search_paths {
            if !path.exists() {
                issues.push(warn(format!(
                    "cli_search_paths entry {} does not exist",
                    path.display()
                )));
            }
        }

        issues
    }

    pub fn approval_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn control_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.control_timeout_ms)
    }

    pub fn mcp_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.mcp_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One authorized runner token. The gateway derives the runner id from the
/// token, so the entry doubles as the runner's identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerAuth {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub authorized_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP/WS bind address.
    pub listen_addr: String,
    /// Authorized runners. Empty = open registration (dev mode).
    pub runners: Vec<RunnerAuth>,
    pub heartbeat_interval_ms: u64,
    /// Decision-ack wait before telling the user the runner may have
    /// processed anyway.
    pub ack_timeout_ms: u64,
    /// Permission entries older than this expire.
    pub permission_ttl_secs: u64,
    /// Cadence of the expiry/offline sweep task.
    pub sweep_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".into(),
            runners: Vec::new(),
            heartbeat_interval_ms: 30_000,
            ack_timeout_ms: 10_000,
            permission_ttl_secs: 900,
            sweep_interval_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.runners.is_empty() {
            issues.push(warn(
                "no runner tokens configured, accepting any registration (dev mode)",
            ));
        }
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for auth in &self.runners {
            if auth.token.len() < 16 {
                issues.push(warn(format!(
                    "token for runner '{}' is shorter than 16 chars",
                    auth.name
                )));
            }
            if let Some(previous) = seen.insert(auth.token.as_str(), auth.name.as_str()) {
                issues.push(error(format!(
                    "runners '{previous}' and '{}' share a token; their ids would collide",
                    auth.name
                )));
            }
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            issues.push(error(format!(
                "listen_addr {} is not a valid socket address",
                self.listen_addr
            )));
        }
        if self.permission_ttl_secs < 900 {
            issues.push(warn(
                "permission_ttl_secs below 900 can expire requests while the chat surface still shows buttons",
            ));
        }

        issues
    }

    pub fn ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn permission_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.permission_ttl_secs)
    }

    /// A runner is considered offline after 2 missed heartbeats.
    pub fn offline_after(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms * 2)
    }
}

fn hostname_or(fallback: &str) -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| fallback.to_string())
}
