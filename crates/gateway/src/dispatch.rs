//! Inbound envelope dispatch.
//!
//! One handler per discriminant, all routed through [`handle_envelope`].
//! Handlers are idempotent with respect to duplicates — late acks,
//! repeated sync frames, and echoed envelopes never corrupt state.

use ar_protocol::Envelope;

use crate::permissions::{scope_label, AckOutcome};
use crate::state::AppState;

pub async fn handle_envelope(state: &AppState, runner_id: &str, envelope: Envelope) {
    match envelope {
        // ── Liveness ─────────────────────────────────────────────────
        Envelope::Heartbeat(data) => {
            state.runners.heartbeat(runner_id, &data.cli_kinds);
        }

        // ── Session traffic ──────────────────────────────────────────
        Envelope::SessionReady(data) => {
            state.sessions.set_status(
                &data.session_id,
                ar_protocol::SessionStatus::Ready,
                None,
            );
            tracing::info!(
                session_id = %data.session_id,
                model = data.model.as_deref().unwrap_or("-"),
                "session ready"
            );
        }
        Envelope::Status(data) => {
            state
                .sessions
                .set_status(&data.session_id, data.status, data.current_tool.clone());
            state.surface.on_session_status(&data).await;
        }
        Envelope::Output(data) => {
            state.sessions.touch(&data.session_id);
            state.surface.on_session_output(&data).await;
        }
        Envelope::Metadata(data) => {
            state.sessions.touch(&data.session_id);
        }
        Envelope::Result(data) => {
            state.sessions.touch(&data.session_id);
            state.surface.on_session_result(&data).await;
        }

        // ── Permission bridge ────────────────────────────────────────
        Envelope::PermissionRequest(data) => {
            let request_id = data.request_id.clone();
            let is_new = state.permissions.insert(data);
            if let Some(entry) = state.permissions.entry(&request_id) {
                tracing::info!(
                    request_id = %request_id,
                    reissued = !is_new,
                    tool = %entry.request.tool_name,
                    "permission request"
                );
                state.surface.on_permission_request(&entry).await;
            }
        }
        Envelope::PermissionDecisionAck(data) => {
            match state.permissions.on_ack(&data.request_id) {
                AckOutcome::Completed => {
                    let label = state
                        .permissions
                        .entry(&data.request_id)
                        .map(|e| scope_label(e.scope))
                        .unwrap_or("session");
                    state
                        .surface
                        .on_permission_update(&data.request_id, "completed", label)
                        .await;
                }
                AckOutcome::Ignored if !data.success => {
                    // The runner no longer has the request (timed out or
                    // restarted). Expire our side and tell the user.
                    if state.permissions.force_expire(&data.request_id) {
                        state
                            .surface
                            .on_permission_update(&data.request_id, "expired", "")
                            .await;
                    }
                    state
                        .surface
                        .notify(
                            None,
                            &format!(
                                "Permission request {} expired on the runner: {}",
                                data.request_id,
                                data.error.as_deref().unwrap_or("no detail")
                            ),
                        )
                        .await;
                }
                AckOutcome::Ignored => {
                    tracing::debug!(request_id = %data.request_id, "late ack, dropping");
                }
            }
        }

        // ── Sync traffic ─────────────────────────────────────────────
        Envelope::SyncProjectsResponse(data) => {
            tracing::info!(runner_id, projects = data.projects.len(), "project listing");
        }
        Envelope::SyncProjectsProgress(data) => {
            tracing::debug!(runner_id, scanned = data.scanned, "{}", data.message);
        }
        Envelope::SyncProjectsComplete(data) => {
            tracing::info!(runner_id, status = ?data.status, "project sync complete");
        }
        Envelope::SyncSessionsResponse(data) => {
            for session in &data.sessions {
                state.sessions.record_synced(
                    runner_id,
                    &session.session_id,
                    session.messages.len(),
                    session.updated_at,
                );
            }
            tracing::debug!(
                runner_id,
                project = %data.project_path,
                chunk = data.chunk_index,
                sessions = data.sessions.len(),
                "session sync frame"
            );
        }
        Envelope::SyncSessionsComplete(data) => {
            tracing::info!(
                runner_id,
                project = %data.project_path,
                sessions = data.session_count,
                status = ?data.status,
                "session sync complete"
            );
        }
        Envelope::SyncSessionDiscovered(data) => {
            state.sessions.record_synced(
                runner_id,
                &data.session.session_id,
                data.session.messages.len(),
                data.session.updated_at,
            );
            tracing::info!(
                runner_id,
                session_id = %data.session.session_id,
                "session discovered"
            );
        }
        Envelope::SyncSessionUpdated(data) => {
            state.sessions.record_synced(
                runner_id,
                &data.session.session_id,
                data.session.messages.len(),
                data.session.updated_at,
            );
            tracing::debug!(
                runner_id,
                session_id = %data.session.session_id,
                "session updated"
            );
        }

        // ── Chat-surface passthroughs ────────────────────────────────
        Envelope::SpawnThread(payload) => {
            state.surface.spawn_thread(runner_id, &payload).await;
        }
        Envelope::DiscordAction(payload) => {
            state.surface.on_ui_action(runner_id, &payload).await;
        }

        // ── Handled elsewhere or not ours ────────────────────────────
        Envelope::Register(_) => {
            // The WS handshake consumed registration; a second one on an
            // open connection is a peer bug.
            tracing::warn!(runner_id, "duplicate register on open connection, ignoring");
        }
        other => {
            tracing::debug!(runner_id, kind = other.kind(), "unexpected envelope on gateway, dropping");
        }
    }
}
