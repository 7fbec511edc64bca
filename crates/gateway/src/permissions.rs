//! Gateway-side permission state store.
//!
//! Each `permission_request` from a runner becomes a short-lived entry:
//! `pending → processing → completed`, or `pending → expired` on TTL.
//! Decision delivery is single-flight — once a request is processing,
//! further clicks are silently dropped — and acks are idempotent, so a
//! duplicate or late ack never corrupts the state machine.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use ar_protocol::envelope::{
    DecisionBehavior, PermissionDecisionData, PermissionRequestData, PermissionScope,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scope cycling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The 4-element scope cycle behind the "Scope" button.
pub fn next_scope(scope: PermissionScope) -> PermissionScope {
    match scope {
        PermissionScope::Session => PermissionScope::LocalSettings,
        PermissionScope::LocalSettings => PermissionScope::UserSettings,
        PermissionScope::UserSettings => PermissionScope::ProjectSettings,
        PermissionScope::ProjectSettings => PermissionScope::Session,
    }
}

pub fn scope_label(scope: PermissionScope) -> &'static str {
    match scope {
        PermissionScope::Session => "session",
        PermissionScope::LocalSettings => "project(local)",
        PermissionScope::UserSettings => "global",
        PermissionScope::ProjectSettings => "project(shared)",
    }
}

pub fn scope_description(scope: PermissionScope) -> &'static str {
    match scope {
        PermissionScope::Session => "this session only",
        PermissionScope::LocalSettings => "this project, your machine settings",
        PermissionScope::UserSettings => "everywhere you use this tool",
        PermissionScope::ProjectSettings => "this project, shared settings",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Pending,
    Processing,
    Completed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PermissionEntry {
    pub request: PermissionRequestData,
    pub status: PermissionStatus,
    pub scope: PermissionScope,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// What `decide` did.
#[derive(Debug)]
pub enum DecideOutcome {
    /// Send this to the runner and start the ack timer.
    Deliver(PermissionDecisionData),
    /// Single-flight: someone already clicked. Drop silently.
    AlreadyProcessing,
    /// Terminal already; the decision is a no-op.
    AlreadyDone,
    /// No state for this id — attempt a reissue.
    Missing,
}

/// What an inbound ack did.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    /// Duplicate/late ack, or ack for a request we never tracked.
    Ignored,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PermissionStore {
    entries: Mutex<HashMap<String, PermissionEntry>>,
    ack_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    ttl: Duration,
}

impl PermissionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ack_timers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Track an inbound `permission_request`. Re-delivery of a known id
    /// (a reissue we asked for) refreshes the request but keeps the
    /// entry's scope and status. Returns `true` for genuinely new ids.
    pub fn insert(&self, request: PermissionRequestData) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&request.request_id) {
            Some(entry) if entry.status == PermissionStatus::Pending => {
                entry.request = request;
                false
            }
            Some(_) => false,
            None => {
                entries.insert(
                    request.request_id.clone(),
                    PermissionEntry {
                        request,
                        status: PermissionStatus::Pending,
                        scope: PermissionScope::Session,
                        created_at: Utc::now(),
                        decided_at: None,
                    },
                );
                true
            }
        }
    }

    pub fn entry(&self, request_id: &str) -> Option<PermissionEntry> {
        self.entries.lock().get(request_id).cloned()
    }

    /// Single-flight decision. Only a pending entry yields a decision to
    /// deliver; everything else is classified for the caller.
    /// `updated_input` carries modified tool input — notably the answers
    /// collected for an AskUserQuestion request.
    pub fn decide(
        &self,
        request_id: &str,
        behavior: DecisionBehavior,
        custom_message: Option<String>,
        updated_input: Option<serde_json::Value>,
    ) -> DecideOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(request_id) else {
            return DecideOutcome::Missing;
        };
        match entry.status {
            PermissionStatus::Pending => {
                entry.status = PermissionStatus::Processing;
                entry.decided_at = Some(Utc::now());
                DecideOutcome::Deliver(PermissionDecisionData {
                    request_id: request_id.to_string(),
                    behavior,
                    scope: Some(entry.scope),
                    updated_permissions: None,
                    updated_input,
                    custom_message,
                    reissue: false,
                })
            }
            PermissionStatus::Processing => DecideOutcome::AlreadyProcessing,
            PermissionStatus::Completed | PermissionStatus::Expired => DecideOutcome::AlreadyDone,
        }
    }

    /// Cycle the UI scope. Pending entries only; never touches status.
    pub fn cycle_scope(&self, request_id: &str) -> Option<(PermissionScope, &'static str)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(request_id)?;
        if entry.status != PermissionStatus::Pending {
            return None;
        }
        entry.scope = next_scope(entry.scope);
        Some((entry.scope, scope_label(entry.scope)))
    }

    /// Deliver an ack from the runner. Idempotent: only a processing
    /// entry completes; duplicates and strays are ignored.
    pub fn on_ack(&self, request_id: &str) -> AckOutcome {
        if let Some(handle) = self.ack_timers.lock().remove(request_id) {
            handle.abort();
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(request_id) {
            Some(entry) if entry.status == PermissionStatus::Processing => {
                entry.status = PermissionStatus::Completed;
                AckOutcome::Completed
            }
            _ => AckOutcome::Ignored,
        }
    }

    /// The runner told us the request is gone on its side (timeout
    /// denial, restart). Expire a still-pending entry.
    pub fn force_expire(&self, request_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(request_id) {
            Some(entry) if entry.status == PermissionStatus::Pending => {
                entry.status = PermissionStatus::Expired;
                true
            }
            _ => false,
        }
    }

    /// Park the ack timer so a later ack can abort it.
    pub fn install_ack_timer(&self, request_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self
            .ack_timers
            .lock()
            .insert(request_id.to_string(), handle)
        {
            previous.abort();
        }
    }

    pub fn ack_timers_outstanding(&self) -> usize {
        self.ack_timers.lock().len()
    }

    /// Expire pending entries past the TTL and GC terminal ones past
    /// twice the TTL. Returns the entries that just expired, for the
    /// chat surface to gray out.
    pub fn sweep(&self) -> Vec<PermissionEntry> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(15));
        let mut expired = Vec::new();

        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if entry.status == PermissionStatus::Pending
                && now.signed_duration_since(entry.created_at) > ttl
            {
                entry.status = PermissionStatus::Expired;
                expired.push(entry.clone());
            }
        }
        entries.retain(|_, entry| {
            !matches!(
                entry.status,
                PermissionStatus::Completed | PermissionStatus::Expired
            ) || now.signed_duration_since(entry.created_at) < ttl * 2
        });

        expired
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.status == PermissionStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(request_id: &str) -> PermissionRequestData {
        PermissionRequestData {
            request_id: request_id.into(),
            session_id: "s1".into(),
            runner_id: "runner_dev_000000000000".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "ls"}),
            suggestions: vec![],
            tool_use_id: None,
            is_plan_mode: false,
            is_question: false,
            blocked_path: None,
            decision_reason: None,
            timestamp: Utc::now(),
        }
    }

    fn store() -> PermissionStore {
        PermissionStore::new(Duration::from_secs(900))
    }

    #[test]
    fn request_decision_ack_completes_with_no_timers() {
        let store = store();
        assert!(store.insert(request("r1")));

        let outcome = store.decide("r1", DecisionBehavior::Allow, None, None);
        let decision = match outcome {
            DecideOutcome::Deliver(d) => d,
            other => panic!("expected Deliver, got {other:?}"),
        };
        assert_eq!(decision.behavior, DecisionBehavior::Allow);
        assert_eq!(decision.scope, Some(PermissionScope::Session));

        assert_eq!(store.on_ack("r1"), AckOutcome::Completed);
        assert_eq!(store.entry("r1").unwrap().status, PermissionStatus::Completed);
        assert_eq!(store.ack_timers_outstanding(), 0);
    }

    #[test]
    fn second_click_is_silently_dropped() {
        let store = store();
        store.insert(request("r1"));
        assert!(matches!(
            store.decide("r1", DecisionBehavior::Allow, None, None),
            DecideOutcome::Deliver(_)
        ));
        assert!(matches!(
            store.decide("r1", DecisionBehavior::Deny, None, None),
            DecideOutcome::AlreadyProcessing
        ));
    }

    #[test]
    fn decision_after_completion_is_a_noop() {
        let store = store();
        store.insert(request("r1"));
        let _ = store.decide("r1", DecisionBehavior::Allow, None, None);
        store.on_ack("r1");
        assert!(matches!(
            store.decide("r1", DecisionBehavior::Deny, None, None),
            DecideOutcome::AlreadyDone
        ));
    }

    #[test]
    fn late_or_duplicate_acks_are_ignored() {
        let store = store();
        store.insert(request("r1"));
        let _ = store.decide("r1", DecisionBehavior::Allow, None, None);
        assert_eq!(store.on_ack("r1"), AckOutcome::Completed);
        assert_eq!(store.on_ack("r1"), AckOutcome::Ignored);
        assert_eq!(store.on_ack("ghost"), AckOutcome::Ignored);
    }

    #[test]
    fn scope_cycles_through_four_labels_without_deciding() {
        let store = store();
        store.insert(request("r1"));

        let labels: Vec<&str> = (0..4)
            .map(|_| store.cycle_scope("r1").unwrap().1)
            .collect();
        assert_eq!(
            labels,
            vec!["project(local)", "global", "project(shared)", "session"]
        );
        // Four clicks land back where we started, still pending.
        let entry = store.entry("r1").unwrap();
        assert_eq!(entry.scope, PermissionScope::Session);
        assert_eq!(entry.status, PermissionStatus::Pending);
    }

    #[test]
    fn scope_cycling_stops_once_processing() {
        let store = store();
        store.insert(request("r1"));
        let _ = store.decide("r1", DecisionBehavior::Allow, None, None);
        assert!(store.cycle_scope("r1").is_none());
    }

    #[test]
    fn decision_carries_the_cycled_scope() {
        let store = store();
        store.insert(request("r1"));
        store.cycle_scope("r1"); // session → project(local)
        match store.decide("r1", DecisionBehavior::Allow, None, None) {
            DecideOutcome::Deliver(d) => {
                assert_eq!(d.scope, Some(PermissionScope::LocalSettings));
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn missing_entries_ask_for_reissue() {
        let store = store();
        assert!(matches!(
            store.decide("ghost", DecisionBehavior::Allow, None, None),
            DecideOutcome::Missing
        ));
    }

    #[test]
    fn reissued_request_refreshes_without_resetting_scope() {
        let store = store();
        store.insert(request("r1"));
        store.cycle_scope("r1");
        assert!(!store.insert(request("r1"))); // reissue delivery
        let entry = store.entry("r1").unwrap();
        assert_eq!(entry.scope, PermissionScope::LocalSettings);
        assert_eq!(entry.status, PermissionStatus::Pending);
    }

    #[test]
    fn sweep_expires_old_pending_entries() {
        let store = PermissionStore::new(Duration::from_secs(0));
        store.insert(request("r1"));
        // TTL of zero: everything pending is immediately overdue.
        std::thread::sleep(Duration::from_millis(5));
        let expired = store.sweep();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request.request_id, "r1");
        assert_eq!(store.pending_count(), 0);
    }
}
