//! Runner-side permission bridge.
//!
//! When a CLI asks `can_use_tool`, the session task parks an entry here,
//! ships a `permission_request` to the gateway, and awaits the decision.
//! No decision within the approval timeout means deny: the CLI never
//! hangs forever on a human who walked away.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use ar_protocol::envelope::{DecisionBehavior, PermissionDecisionData, PermissionRequestData};

struct PendingPermission {
    request: PermissionRequestData,
    respond: oneshot::Sender<PermissionDecisionData>,
}

/// Thread-safe store of permission requests awaiting a gateway decision.
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, PendingPermission>>,
    approval_timeout: Duration,
}

impl PermissionBroker {
    pub fn new(approval_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            approval_timeout,
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout
    }

    /// Park a request; the receiver resolves when the gateway decides.
    pub fn register(
        &self,
        request: PermissionRequestData,
    ) -> oneshot::Receiver<PermissionDecisionData> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(
            request.request_id.clone(),
            PendingPermission {
                request,
                respond: tx,
            },
        );
        if previous.is_some() {
            tracing::warn!("duplicate permission request id, replacing older entry");
        }
        rx
    }

    /// Deliver a gateway decision. `false` when the request is unknown
    /// (already decided, timed out, or never ours).
    pub fn resolve(&self, decision: PermissionDecisionData) -> bool {
        match self.pending.lock().remove(&decision.request_id) {
            Some(pending) => pending.respond.send(decision).is_ok(),
            None => false,
        }
    }

    /// The original request, if still pending — for gateway reissues.
    pub fn pending_request(&self, request_id: &str) -> Option<PermissionRequestData> {
        self.pending
            .lock()
            .get(request_id)
            .map(|p| p.request.clone())
    }

    /// Drop the entry after a timeout (the waiter already moved on).
    pub fn discard(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    /// Cancel everything parked for one session (session end/exit).
    /// Dropping the senders fails the waiters recoverably.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.request.session_id != session_id);
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// The `control_response` payload the CLI expects for a decision.
pub fn decision_payload(decision: &PermissionDecisionData) -> Value {
    match decision.behavior {
        DecisionBehavior::Allow => {
            let mut payload = serde_json::json!({"behavior": "allow"});
            if let Some(input) = &decision.updated_input {
                payload["updatedInput"] = input.clone();
            }
            if let Some(permissions) = &decision.updated_permissions {
                payload["updatedPermissions"] = permissions.clone();
            }
            payload
        }
        DecisionBehavior::Deny => {
            let message = decision
                .custom_message
                .clone()
                .unwrap_or_else(|| "Denied by user".to_string());
            serde_json::json!({"behavior": "deny", "message": message})
        }
    }
}

/// The payload sent when nobody decided in time.
pub fn timeout_payload(waited: Duration) -> Value {
    serde_json::json!({
        "behavior": "deny",
        "message": format!("No decision after {}s, denying", waited.as_secs()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(request_id: &str, session_id: &str) -> PermissionRequestData {
        PermissionRequestData {
            request_id: request_id.into(),
            session_id: session_id.into(),
            runner_id: "runner_test_000000000000".into(),
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

    fn decision(request_id: &str, behavior: DecisionBehavior) -> PermissionDecisionData {
        PermissionDecisionData {
            request_id: request_id.into(),
            behavior,
            scope: None,
            updated_permissions: None,
            updated_input: None,
            custom_message: None,
            reissue: false,
        }
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let broker = PermissionBroker::new(Duration::from_secs(30));
        let rx = broker.register(request("r1", "s1"));
        assert!(broker.resolve(decision("r1", DecisionBehavior::Allow)));
        let decided = rx.await.unwrap();
        assert_eq!(decided.behavior, DecisionBehavior::Allow);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_decision_is_a_noop() {
        let broker = PermissionBroker::new(Duration::from_secs(30));
        assert!(!broker.resolve(decision("ghost", DecisionBehavior::Deny)));
    }

    #[tokio::test]
    async fn cancel_session_fails_waiters_recoverably() {
        let broker = PermissionBroker::new(Duration::from_secs(30));
        let rx1 = broker.register(request("r1", "s1"));
        let _rx2 = broker.register(request("r2", "s2"));

        assert_eq!(broker.cancel_session("s1"), 1);
        assert!(rx1.await.is_err());
        assert_eq!(broker.pending_count(), 1);
    }

    #[tokio::test]
    async fn reissue_reads_without_consuming() {
        let broker = PermissionBroker::new(Duration::from_secs(30));
        let _rx = broker.register(request("r1", "s1"));
        assert!(broker.pending_request("r1").is_some());
        assert!(broker.pending_request("r1").is_some());
        assert_eq!(broker.pending_count(), 1);
    }

    #[test]
    fn allow_payload_carries_updates() {
        let mut d = decision("r1", DecisionBehavior::Allow);
        d.updated_input = Some(serde_json::json!({"command": "ls -la"}));
        let payload = decision_payload(&d);
        assert_eq!(payload["behavior"], "allow");
        assert_eq!(payload["updatedInput"]["command"], "ls -la");
    }

    #[test]
    fn deny_payload_prefers_the_custom_message() {
        let mut d = decision("r1", DecisionBehavior::Deny);
        d.custom_message = Some("use rg instead".into());
        let payload = decision_payload(&d);
        assert_eq!(payload["behavior"], "deny");
        assert_eq!(payload["message"], "use rg instead");
    }
}
