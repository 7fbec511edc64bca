//! Inbound envelope dispatch for the runner.
//!
//! One loop drains the link's inbound channel and routes each envelope to
//! the owning component. Per-session work is spawned so a slow session
//! never stalls the loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ar_domain::config::RunnerConfig;
use ar_protocol::envelope::{PermissionDecisionAckData, PermissionDecisionData};
use ar_protocol::Envelope;

use crate::link::LinkHandle;
use crate::permissions::PermissionBroker;
use crate::registry::SessionRegistry;
use crate::session;
use crate::sync::SyncService;

/// Everything a handler needs, cloned per spawned task.
#[derive(Clone)]
pub struct RunnerCtx {
    pub config: Arc<RunnerConfig>,
    pub link: LinkHandle,
    pub registry: Arc<SessionRegistry>,
    pub broker: Arc<PermissionBroker>,
    pub sync: Arc<SyncService>,
    pub runner_id: String,
}

/// Drain inbound envelopes until the channel closes or shutdown fires.
pub async fn run(
    ctx: RunnerCtx,
    mut inbound: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            maybe = inbound.recv() => match maybe {
                Some(envelope) => handle_envelope(&ctx, envelope).await,
                None => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}

pub async fn handle_envelope(ctx: &RunnerCtx, envelope: Envelope) {
    match envelope {
        Envelope::Registered(data) => {
            // Reclaimed or fresh, the gateway's view of our sessions was
            // discarded; nothing to replay beyond heartbeat state.
            tracing::debug!(runner_id = %data.runner_id, reclaimed = data.reclaimed, "registration confirmed");
        }

        Envelope::SessionStart(data) => {
            session::start(ctx, data).await;
        }
        Envelope::UserMessage(data) => {
            session::user_message(ctx, data).await;
        }
        Envelope::SessionEnd(data) => {
            session::end(ctx, &data.session_id, "gateway request").await;
        }
        Envelope::Interrupt(data) => {
            session::interrupt(ctx, data).await;
        }

        Envelope::PermissionDecision(data) => {
            handle_decision(ctx, data).await;
        }

        Envelope::SyncProjects(_) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.sync.sync_projects(&ctx.link).await;
            });
        }
        Envelope::SyncSessions(data) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.sync.sync_sessions(&ctx.link, data.project_path).await;
            });
        }

        // Runner-originated types echoed back, or gateway-only traffic:
        // log and drop, never fatal.
        other => {
            tracing::debug!(kind = other.kind(), "unexpected envelope on runner, dropping");
        }
    }
}

async fn handle_decision(ctx: &RunnerCtx, decision: PermissionDecisionData) {
    // A reissue is not a decision: the gateway lost its UI state and
    // wants the original request again.
    if decision.reissue {
        match ctx.broker.pending_request(&decision.request_id) {
            Some(request) => {
                tracing::info!(request_id = %decision.request_id, "re-sending permission request");
                ctx.link.send(Envelope::PermissionRequest(request));
            }
            None => {
                // Both sides forgot; tell the gateway so it can inform
                // the user the request expired.
                ctx.link
                    .send(Envelope::PermissionDecisionAck(PermissionDecisionAckData {
                        request_id: decision.request_id.clone(),
                        session_id: String::new(),
                        success: false,
                        error: Some("request expired on the runner".into()),
                    }));
            }
        }
        return;
    }

    if !ctx.broker.resolve(decision.clone()) {
        // Duplicate or late decision — idempotent drop, but ack so the
        // gateway can settle its state machine.
        tracing::debug!(request_id = %decision.request_id, "decision for unknown request, dropping");
        ctx.link
            .send(Envelope::PermissionDecisionAck(PermissionDecisionAckData {
                request_id: decision.request_id,
                session_id: String::new(),
                success: false,
                error: Some("request not pending on the runner".into()),
            }));
    }
}
