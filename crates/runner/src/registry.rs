//! In-memory registry of live CLI sessions on this runner.
//!
//! Invariant: a session id maps to at most one live client. Start data is
//! kept as a blueprint after the client dies so `user_message` can attempt
//! auto-recovery (respawn-with-resume) instead of failing outright.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use ar_cli_client::CliClient;
use ar_domain::{Error, Result};
use ar_protocol::envelope::SessionStartData;
use ar_protocol::{CliKind, PluginVariant};

/// One live session.
#[derive(Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub kind: CliKind,
    pub variant: PluginVariant,
    pub cwd: PathBuf,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub client: CliClient,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Start parameters of every session this runner has seen, kept past
    /// client death for auto-recovery.
    blueprints: RwLock<HashMap<String, SessionStartData>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live client. Rejects duplicates: at most one live
    /// client per session id.
    pub fn insert(&self, entry: SessionEntry, blueprint: SessionStartData) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&entry.session_id) {
            return Err(Error::Session {
                session_id: entry.session_id,
                message: "session already has a live client".into(),
            });
        }
        self.blueprints
            .write()
            .insert(entry.session_id.clone(), blueprint);
        sessions.insert(entry.session_id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Drop the live client (keeps the blueprint for recovery).
    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.write().remove(session_id)
    }

    /// Forget a session entirely (explicit `session_end`).
    pub fn forget(&self, session_id: &str) -> Option<SessionEntry> {
        self.blueprints.write().remove(session_id);
        self.sessions.write().remove(session_id)
    }

    pub fn blueprint(&self, session_id: &str) -> Option<SessionStartData> {
        self.blueprints.read().get(session_id).cloned()
    }

    /// Sessions this runner created — the sync watcher excludes these to
    /// avoid echoing our own live output back as transcript updates.
    pub fn owned_ids(&self) -> HashSet<String> {
        self.blueprints.read().keys().cloned().collect()
    }

    pub fn is_owned(&self, session_id: &str) -> bool {
        self.blueprints.read().contains_key(session_id)
    }

    pub fn live_entries(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
impl SessionRegistry {
    /// Mark a session id as owned without spawning a client.
    pub(crate) fn insert_blueprint_for_tests(&self, session_id: &str) {
        self.blueprints.write().insert(
            session_id.to_string(),
            SessionStartData {
                session_id: session_id.to_string(),
                cli_kind: CliKind::Claude,
                variant: PluginVariant::Sdk,
                cwd: ".".into(),
                create_dir: false,
                user: None,
                options: Default::default(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_cli_client::{ClientConfig, CliProcess};
    use tokio::sync::mpsc;

    fn entry(session_id: &str) -> (SessionEntry, SessionStartData) {
        let (process, _stdin) = CliProcess::from_channel();
        let (_lines_tx, lines_rx) = mpsc::channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let client = CliClient::start(process, lines_rx, ClientConfig::default(), events_tx);
        (
            SessionEntry {
                session_id: session_id.into(),
                kind: CliKind::Claude,
                variant: PluginVariant::Sdk,
                cwd: PathBuf::from("/tmp"),
                created_by: None,
                created_at: Utc::now(),
                client,
            },
            SessionStartData {
                session_id: session_id.into(),
                cli_kind: CliKind::Claude,
                variant: PluginVariant::Sdk,
                cwd: "/tmp".into(),
                create_dir: false,
                user: None,
                options: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn at_most_one_live_client_per_session() {
        let registry = SessionRegistry::new();
        let (first, blueprint) = entry("s1");
        registry.insert(first, blueprint.clone()).unwrap();

        let (second, blueprint2) = entry("s1");
        let err = registry.insert(second, blueprint2).unwrap_err();
        assert!(matches!(err, Error::Session { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_keeps_blueprint_forget_drops_it() {
        let registry = SessionRegistry::new();
        let (e, blueprint) = entry("s1");
        registry.insert(e, blueprint).unwrap();

        registry.remove("s1");
        assert!(registry.get("s1").is_none());
        assert!(registry.blueprint("s1").is_some());
        assert!(registry.is_owned("s1"));

        registry.forget("s1");
        assert!(registry.blueprint("s1").is_none());
        assert!(!registry.is_owned("s1"));
    }
}
