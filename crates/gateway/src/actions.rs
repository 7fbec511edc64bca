//! User actions.
//!
//! The chat layer translates clicks and commands into these calls; they
//! are the only mutation path besides inbound envelopes. Authorization is
//! checked here so no surface can bypass it.

use chrono::Utc;
use uuid::Uuid;

use ar_protocol::envelope::{
    DecisionBehavior, InterruptData, SessionEndData, SessionStartData, SyncSessionsData,
    UserMessageData,
};
use ar_protocol::{CliKind, Envelope, PluginVariant, SessionOptions, SessionStatus};

use crate::permissions::{scope_label, DecideOutcome, PermissionStatus};
use crate::sessions::SessionMeta;
use crate::state::AppState;

/// Hard cap on a "tell the agent why" denial message.
const MAX_CUSTOM_MESSAGE_CHARS: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("user {user} is not authorized on runner {runner_id}")]
    NotAuthorized { user: String, runner_id: String },

    #[error("runner {0} is offline")]
    RunnerOffline(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("{0}")]
    Internal(String),
}

/// Outcome of an approve/deny click.
#[derive(Debug, PartialEq, Eq)]
pub enum DecisionResult {
    /// Decision delivered; the ack timer is running.
    Sent,
    /// Single-flight drop: an earlier click is in flight or done.
    Dropped,
    /// State was lost; the runner was asked to re-send the request.
    Reissued,
    /// Nobody remembers the request; the user was told it expired.
    Expired,
}

impl AppState {
    fn authorize(&self, user: &str, runner_id: &str) -> Result<(), ActionError> {
        let allowed = self.runners.authorized_users(runner_id);
        if allowed.is_empty() || allowed.iter().any(|u| u == user) {
            Ok(())
        } else {
            Err(ActionError::NotAuthorized {
                user: user.to_string(),
                runner_id: runner_id.to_string(),
            })
        }
    }

    // ── Session actions ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        runner_id: &str,
        user: &str,
        cli_kind: CliKind,
        variant: PluginVariant,
        cwd: String,
        create_dir: bool,
        options: SessionOptions,
    ) -> Result<String, ActionError> {
        self.authorize(user, runner_id)?;
        if !self.runners.is_online(runner_id) {
            return Err(ActionError::RunnerOffline(runner_id.to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let data = SessionStartData {
            session_id: session_id.clone(),
            cli_kind,
            variant,
            cwd: cwd.clone(),
            create_dir,
            user: Some(user.to_string()),
            options,
        };
        if !self
            .runners
            .send(runner_id, Envelope::SessionStart(data))
            .await
        {
            return Err(ActionError::RunnerOffline(runner_id.to_string()));
        }

        self.sessions.insert(SessionMeta {
            session_id: session_id.clone(),
            runner_id: runner_id.to_string(),
            cli_kind,
            variant,
            cwd,
            created_by: Some(user.to_string()),
            created_at: Utc::now(),
            status: SessionStatus::Starting,
            current_tool: None,
            last_activity: Utc::now(),
        });
        Ok(session_id)
    }

    pub async fn send_user_message(
        &self,
        session_id: &str,
        user: &str,
        text: String,
    ) -> Result<(), ActionError> {
        let runner_id = self
            .sessions
            .runner_of(session_id)
            .ok_or_else(|| ActionError::UnknownSession(session_id.to_string()))?;
        self.authorize(user, &runner_id)?;

        let sent = self
            .runners
            .send(
                &runner_id,
                Envelope::UserMessage(UserMessageData {
                    session_id: session_id.to_string(),
                    text,
                }),
            )
            .await;
        if sent {
            Ok(())
        } else {
            Err(ActionError::RunnerOffline(runner_id))
        }
    }

    pub async fn end_session(&self, session_id: &str) -> Result<(), ActionError> {
        let runner_id = self
            .sessions
            .runner_of(session_id)
            .ok_or_else(|| ActionError::UnknownSession(session_id.to_string()))?;
        self.runners
            .send(
                &runner_id,
                Envelope::SessionEnd(SessionEndData {
                    session_id: session_id.to_string(),
                }),
            )
            .await;
        self.sessions.remove(session_id);
        Ok(())
    }

    pub async fn interrupt_session(&self, session_id: &str) -> Result<(), ActionError> {
        let runner_id = self
            .sessions
            .runner_of(session_id)
            .ok_or_else(|| ActionError::UnknownSession(session_id.to_string()))?;
        let sent = self
            .runners
            .send(
                &runner_id,
                Envelope::Interrupt(InterruptData {
                    session_id: session_id.to_string(),
                }),
            )
            .await;
        if sent {
            Ok(())
        } else {
            Err(ActionError::RunnerOffline(runner_id))
        }
    }

    // ── Permission actions ───────────────────────────────────────────

    pub async fn approve_permission(
        &self,
        request_id: &str,
        runner_hint: Option<&str>,
    ) -> DecisionResult {
        self.deliver_decision(request_id, DecisionBehavior::Allow, None, None, runner_hint)
            .await
    }

    /// Allow with modified tool input — the path an AskUserQuestion takes
    /// once the surface has collected every answer.
    pub async fn answer_permission(
        &self,
        request_id: &str,
        updated_input: serde_json::Value,
        runner_hint: Option<&str>,
    ) -> DecisionResult {
        self.deliver_decision(
            request_id,
            DecisionBehavior::Allow,
            None,
            Some(updated_input),
            runner_hint,
        )
        .await
    }

    /// Deny, optionally with a "tell the agent why" paragraph.
    pub async fn deny_permission(
        &self,
        request_id: &str,
        custom_message: Option<String>,
        runner_hint: Option<&str>,
    ) -> DecisionResult {
        let message = custom_message.map(|m| {
            if m.chars().count() > MAX_CUSTOM_MESSAGE_CHARS {
                m.chars().take(MAX_CUSTOM_MESSAGE_CHARS).collect()
            } else {
                m
            }
        });
        self.deliver_decision(request_id, DecisionBehavior::Deny, message, None, runner_hint)
            .await
    }

    /// Cycle the pending request's scope; returns the new label for the
    /// surface to re-render. Never sends a decision.
    pub fn cycle_permission_scope(&self, request_id: &str) -> Option<&'static str> {
        self.permissions
            .cycle_scope(request_id)
            .map(|(_, label)| label)
    }

    async fn deliver_decision(
        &self,
        request_id: &str,
        behavior: DecisionBehavior,
        custom_message: Option<String>,
        updated_input: Option<serde_json::Value>,
        runner_hint: Option<&str>,
    ) -> DecisionResult {
        match self
            .permissions
            .decide(request_id, behavior, custom_message, updated_input)
        {
            DecideOutcome::Deliver(decision) => {
                let runner_id = self
                    .permissions
                    .entry(request_id)
                    .map(|e| e.request.runner_id.clone())
                    .unwrap_or_default();
                let sent = self
                    .runners
                    .send(&runner_id, Envelope::PermissionDecision(decision))
                    .await;
                if !sent {
                    self.surface
                        .notify(
                            None,
                            &format!("Runner {runner_id} is offline; the decision could not be delivered"),
                        )
                        .await;
                }
                self.surface
                    .on_permission_update(
                        request_id,
                        "processing",
                        self.permissions
                            .entry(request_id)
                            .map(|e| scope_label(e.scope))
                            .unwrap_or("session"),
                    )
                    .await;
                self.start_ack_timer(request_id);
                DecisionResult::Sent
            }
            DecideOutcome::AlreadyProcessing | DecideOutcome::AlreadyDone => {
                // Buttons vanish on processing-start; this is a click
                // from a stale cache. Drop it silently.
                DecisionResult::Dropped
            }
            DecideOutcome::Missing => self.reissue(request_id, behavior, runner_hint).await,
        }
    }

    /// We lost the state: ask the runner to re-send the request so the
    /// user gets a fresh prompt.
    async fn reissue(
        &self,
        request_id: &str,
        behavior: DecisionBehavior,
        runner_hint: Option<&str>,
    ) -> DecisionResult {
        let Some(runner_id) = runner_hint else {
            self.surface
                .notify(None, &format!("Permission request {request_id} has expired"))
                .await;
            return DecisionResult::Expired;
        };

        let asked = self
            .runners
            .send(
                runner_id,
                Envelope::PermissionDecision(ar_protocol::envelope::PermissionDecisionData {
                    request_id: request_id.to_string(),
                    behavior,
                    scope: None,
                    updated_permissions: None,
                    updated_input: None,
                    custom_message: None,
                    reissue: true,
                }),
            )
            .await;
        if asked {
            DecisionResult::Reissued
        } else {
            self.surface
                .notify(None, &format!("Permission request {request_id} has expired"))
                .await;
            DecisionResult::Expired
        }
    }

    fn start_ack_timer(&self, request_id: &str) {
        let state = self.clone();
        let request_id_owned = request_id.to_string();
        let wait = self.config.ack_timeout();
        let handle = tokio::spawn(async move {
            let request_id = request_id_owned;
            tokio::time::sleep(wait).await;
            let still_processing = state
                .permissions
                .entry(&request_id)
                .is_some_and(|e| e.status == PermissionStatus::Processing);
            if still_processing {
                state
                    .surface
                    .notify(
                        None,
                        &format!(
                            "No ack for {request_id} after {}s — the runner may have processed it anyway",
                            wait.as_secs()
                        ),
                    )
                    .await;
            }
        });
        self.permissions.install_ack_timer(request_id, handle);
    }

    // ── Sync actions ─────────────────────────────────────────────────

    pub async fn request_project_sync(&self, runner_id: &str) -> bool {
        self.runners
            .send(runner_id, Envelope::SyncProjects(Default::default()))
            .await
    }

    pub async fn request_session_sync(&self, runner_id: &str, project_path: String) -> bool {
        self.runners
            .send(
                runner_id,
                Envelope::SyncSessions(SyncSessionsData { project_path }),
            )
            .await
    }
}
