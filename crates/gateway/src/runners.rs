//! In-memory registry of runners, online and offline.
//!
//! Entries survive disconnects: the runner id is derived from the token,
//! so the same runner restarting re-registers under the same id and
//! reclaims its registration (`reclaimed=true`). Offline runners are
//! marked, never removed — removal would break reclaim.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use ar_protocol::envelope::RegisterData;
use ar_protocol::{runner_id, CliKind, Envelope};

/// Channel to a connected runner's WS writer task.
pub type RunnerSink = mpsc::Sender<Envelope>;

pub struct RunnerEntry {
    pub runner_id: String,
    pub name: String,
    pub cli_kinds: Vec<CliKind>,
    pub default_workspace: Option<String>,
    pub authorized_users: Vec<String>,
    pub online: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    sink: Option<RunnerSink>,
}

/// Summary for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub runner_id: String,
    pub name: String,
    pub cli_kinds: Vec<CliKind>,
    pub online: bool,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, RunnerEntry>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner connection. Returns `(runner_id, reclaimed)`;
    /// `reclaimed` is true whenever this token was seen before, which
    /// also covers promoting a new connection over a stale one.
    pub fn register(
        &self,
        register: &RegisterData,
        authorized_users: Vec<String>,
        sink: RunnerSink,
    ) -> (String, bool) {
        let id = runner_id(&register.runner_name, &register.token);
        let mut runners = self.runners.write();
        let reclaimed = runners.contains_key(&id);

        runners.insert(
            id.clone(),
            RunnerEntry {
                runner_id: id.clone(),
                name: register.runner_name.clone(),
                cli_kinds: register.cli_kinds.clone(),
                default_workspace: register.default_workspace.clone(),
                authorized_users,
                online: true,
                last_heartbeat: Utc::now(),
                connected_at: Some(Utc::now()),
                sink: Some(sink),
            },
        );

        tracing::info!(runner_id = %id, reclaimed, "runner registered");
        (id, reclaimed)
    }

    /// Record a heartbeat (also refreshes the advertised CLI kinds).
    pub fn heartbeat(&self, runner_id: &str, cli_kinds: &[CliKind]) {
        if let Some(entry) = self.runners.write().get_mut(runner_id) {
            entry.last_heartbeat = Utc::now();
            entry.online = true;
            if !cli_kinds.is_empty() {
                entry.cli_kinds = cli_kinds.to_vec();
            }
        }
    }

    /// Connection closed: mark offline, drop the sink, keep the entry.
    pub fn mark_offline(&self, runner_id: &str) {
        if let Some(entry) = self.runners.write().get_mut(runner_id) {
            entry.online = false;
            entry.sink = None;
            tracing::info!(runner_id, "runner offline");
        }
    }

    /// Mark runners silent for longer than `max_silence` offline.
    /// Returns the ids that flipped.
    pub fn sweep_silent(&self, max_silence: chrono::Duration) -> Vec<String> {
        let now = Utc::now();
        let mut flipped = Vec::new();
        for entry in self.runners.write().values_mut() {
            if entry.online && now.signed_duration_since(entry.last_heartbeat) > max_silence {
                entry.online = false;
                entry.sink = None;
                flipped.push(entry.runner_id.clone());
            }
        }
        flipped
    }

    pub fn sink(&self, runner_id: &str) -> Option<RunnerSink> {
        self.runners
            .read()
            .get(runner_id)
            .and_then(|e| e.sink.clone())
    }

    /// Push one envelope to a runner. `false` when it is offline or the
    /// queue is gone.
    pub async fn send(&self, runner_id: &str, envelope: Envelope) -> bool {
        match self.sink(runner_id) {
            Some(sink) => sink.send(envelope).await.is_ok(),
            None => false,
        }
    }

    pub fn is_online(&self, runner_id: &str) -> bool {
        self.runners
            .read()
            .get(runner_id)
            .is_some_and(|e| e.online)
    }

    pub fn authorized_users(&self, runner_id: &str) -> Vec<String> {
        self.runners
            .read()
            .get(runner_id)
            .map(|e| e.authorized_users.clone())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<RunnerInfo> {
        let mut infos: Vec<RunnerInfo> = self
            .runners
            .read()
            .values()
            .map(|e| RunnerInfo {
                runner_id: e.runner_id.clone(),
                name: e.name.clone(),
                cli_kinds: e.cli_kinds.clone(),
                online: e.online,
                last_heartbeat: e.last_heartbeat,
            })
            .collect();
        infos.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        infos
    }

    pub fn online_count(&self) -> usize {
        self.runners.read().values().filter(|e| e.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_data(name: &str, token: &str) -> RegisterData {
        RegisterData {
            runner_name: name.into(),
            token: token.into(),
            cli_kinds: vec![CliKind::Claude],
            default_workspace: None,
        }
    }

    #[tokio::test]
    async fn same_token_reclaims_same_id() {
        let registry = RunnerRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (first_id, reclaimed) = registry.register(&register_data("dev", "tok"), vec![], tx1);
        assert!(!reclaimed);

        registry.mark_offline(&first_id);
        assert!(!registry.is_online(&first_id));

        let (tx2, _rx2) = mpsc::channel(8);
        let (second_id, reclaimed) = registry.register(&register_data("dev", "tok"), vec![], tx2);
        assert_eq!(first_id, second_id);
        assert!(reclaimed);
        assert!(registry.is_online(&second_id));
    }

    #[tokio::test]
    async fn duplicate_connection_promotes_the_new_sink() {
        let registry = RunnerRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (id, _) = registry.register(&register_data("dev", "tok"), vec![], tx1);

        let (tx2, mut rx2) = mpsc::channel(8);
        let (_, reclaimed) = registry.register(&register_data("dev", "tok"), vec![], tx2);
        assert!(reclaimed);

        assert!(registry.send(&id, Envelope::SyncProjects(Default::default())).await);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_offline_runner_fails_fast() {
        let registry = RunnerRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let (id, _) = registry.register(&register_data("dev", "tok"), vec![], tx);
        registry.mark_offline(&id);
        assert!(!registry.send(&id, Envelope::SyncProjects(Default::default())).await);
    }

    #[tokio::test]
    async fn sweep_flips_silent_runners() {
        let registry = RunnerRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let (id, _) = registry.register(&register_data("dev", "tok"), vec![], tx);

        // Backdate the heartbeat past the window.
        registry.runners.write().get_mut(&id).unwrap().last_heartbeat =
            Utc::now() - chrono::Duration::seconds(120);

        let flipped = registry.sweep_silent(chrono::Duration::seconds(60));
        assert_eq!(flipped, vec![id.clone()]);
        assert!(!registry.is_online(&id));

        // Idempotent: already offline runners don't flip again.
        assert!(registry.sweep_silent(chrono::Duration::seconds(60)).is_empty());
    }
}
