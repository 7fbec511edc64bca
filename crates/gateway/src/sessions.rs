//! Gateway-side session metadata index.
//!
//! The gateway never owns a CLI process; it tracks what runners report:
//! which sessions exist, where they live, their status, and a small cache
//! of synced-transcript bookkeeping per (runner, project).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use ar_protocol::{CliKind, PluginVariant, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub runner_id: String,
    pub cli_kind: CliKind,
    pub variant: PluginVariant,
    pub cwd: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub current_tool: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Bookkeeping about a synced (not gateway-created) session.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncedSession {
    pub message_count: usize,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct SessionIndex {
    sessions: RwLock<HashMap<String, SessionMeta>>,
    synced: RwLock<HashMap<(String, String), SyncedSession>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: SessionMeta) {
        self.sessions.write().insert(meta.session_id.clone(), meta);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.write().remove(session_id)
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus, current_tool: Option<String>) {
        if let Some(meta) = self.sessions.write().get_mut(session_id) {
            meta.status = status;
            meta.current_tool = current_tool;
            meta.last_activity = Utc::now();
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(meta) = self.sessions.write().get_mut(session_id) {
            meta.last_activity = Utc::now();
        }
    }

    /// A runner vanished: all of its sessions go offline.
    pub fn mark_runner_offline(&self, runner_id: &str) -> usize {
        let mut count = 0;
        for meta in self.sessions.write().values_mut() {
            if meta.runner_id == runner_id && meta.status != SessionStatus::Offline {
                meta.status = SessionStatus::Offline;
                count += 1;
            }
        }
        count
    }

    pub fn runner_of(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .get(session_id)
            .map(|m| m.runner_id.clone())
    }

    pub fn list(&self) -> Vec<SessionMeta> {
        let mut sessions: Vec<SessionMeta> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    // ── Synced transcript bookkeeping ────────────────────────────────

    pub fn record_synced(
        &self,
        runner_id: &str,
        session_id: &str,
        message_count: usize,
        updated_at: DateTime<Utc>,
    ) {
        let mut synced = self.synced.write();
        let entry = synced
            .entry((runner_id.to_string(), session_id.to_string()))
            .or_default();
        entry.message_count = message_count;
        entry.last_update = Some(updated_at);
    }

    pub fn synced_count(&self) -> usize {
        self.synced.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session_id: &str, runner_id: &str) -> SessionMeta {
        SessionMeta {
            session_id: session_id.into(),
            runner_id: runner_id.into(),
            cli_kind: CliKind::Claude,
            variant: PluginVariant::Sdk,
            cwd: "/tmp".into(),
            created_by: Some("alice".into()),
            created_at: Utc::now(),
            status: SessionStatus::Starting,
            current_tool: None,
            last_activity: Utc::now(),
        }
    }

    #[test]
    fn runner_offline_cascades_to_sessions() {
        let index = SessionIndex::new();
        index.insert(meta("s1", "r1"));
        index.insert(meta("s2", "r1"));
        index.insert(meta("s3", "r2"));

        assert_eq!(index.mark_runner_offline("r1"), 2);
        assert_eq!(index.get("s1").unwrap().status, SessionStatus::Offline);
        assert_eq!(index.get("s3").unwrap().status, SessionStatus::Starting);
        // Second sweep is a no-op.
        assert_eq!(index.mark_runner_offline("r1"), 0);
    }

    #[test]
    fn status_updates_track_activity() {
        let index = SessionIndex::new();
        index.insert(meta("s1", "r1"));
        index.set_status("s1", SessionStatus::Working, Some("Bash".into()));
        let meta = index.get("s1").unwrap();
        assert_eq!(meta.status, SessionStatus::Working);
        assert_eq!(meta.current_tool.as_deref(), Some("Bash"));
    }
}
