//! The chat-surface seam.
//!
//! Rendering (embeds, buttons, modals) lives outside this crate. The
//! gateway core only ever talks to the surface through this trait; the
//! default implementation logs, which is also what keeps the core
//! testable without any chat backend.

use async_trait::async_trait;
use serde_json::Value;

use ar_protocol::envelope::{OutputData, ResultData, StatusData};

use crate::permissions::PermissionEntry;

#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// A new (or reissued) permission request needs rendering.
    async fn on_permission_request(&self, entry: &PermissionEntry);

    /// Status change on an existing permission prompt (processing,
    /// completed, expired, scope changed).
    async fn on_permission_update(&self, request_id: &str, state: &str, scope_label: &str);

    async fn on_session_output(&self, data: &OutputData);
    async fn on_session_status(&self, data: &StatusData);
    async fn on_session_result(&self, data: &ResultData);

    /// A runner asked for a new chat thread. Payload is surface-owned.
    async fn spawn_thread(&self, runner_id: &str, payload: &Value);

    /// Generic UI action passthrough from a runner.
    async fn on_ui_action(&self, runner_id: &str, payload: &Value);

    /// Free-form user-facing notice ("the runner may have processed this
    /// anyway", "request expired", …).
    async fn notify(&self, session_id: Option<&str>, text: &str);
}

/// Logs everything; used headless and in tests.
pub struct LoggingSurface;

#[async_trait]
impl ChatSurface for LoggingSurface {
    async fn on_permission_request(&self, entry: &PermissionEntry) {
        tracing::info!(
            request_id = %entry.request.request_id,
            tool = %entry.request.tool_name,
            "permission request awaiting decision"
        );
    }

    async fn on_permission_update(&self, request_id: &str, state: &str, scope_label: &str) {
        tracing::info!(request_id, state, scope = scope_label, "permission update");
    }

    async fn on_session_output(&self, data: &OutputData) {
        tracing::debug!(
            session_id = %data.session_id,
            kind = ?data.kind,
            bytes = data.content.len(),
            "session output"
        );
    }

    async fn on_session_status(&self, data: &StatusData) {
        tracing::debug!(session_id = %data.session_id, status = ?data.status, "session status");
    }

    async fn on_session_result(&self, data: &ResultData) {
        tracing::info!(
            session_id = %data.session_id,
            is_error = data.is_error,
            duration_ms = data.duration_ms,
            "turn finished"
        );
    }

    async fn spawn_thread(&self, runner_id: &str, payload: &Value) {
        tracing::info!(runner_id, payload = %payload, "spawn_thread passthrough");
    }

    async fn on_ui_action(&self, runner_id: &str, payload: &Value) {
        tracing::info!(runner_id, payload = %payload, "ui action passthrough");
    }

    async fn notify(&self, session_id: Option<&str>, text: &str) {
        tracing::info!(session_id = session_id.unwrap_or("-"), text, "user notice");
    }
}
