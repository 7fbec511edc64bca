//! Local health endpoint.
//!
//! `GET /healthz` answers with uptime, live session count, link state,
//! and the sync status — enough for a supervisor probe or a quick curl.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::dispatch::RunnerCtx;

#[derive(Clone)]
struct HealthState {
    ctx: RunnerCtx,
    started: Instant,
}

/// Serve `/healthz` on the configured port. Never returns unless the
/// listener dies; callers spawn it.
pub async fn serve(ctx: RunnerCtx, port: u16) {
    let state = HealthState {
        ctx,
        started: Instant::now(),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(port, error = %e, "health endpoint unavailable");
            return;
        }
    };
    tracing::info!(addr = %addr, "health endpoint ready");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::warn!(error = %e, "health endpoint stopped");
    }
}

async fn healthz(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "runner_id": state.ctx.runner_id,
        "uptime_secs": state.started.elapsed().as_secs(),
        "sessions": state.ctx.registry.len(),
        "link_connected": state.ctx.link.is_connected(),
        "pending_permissions": state.ctx.broker.pending_count(),
        "sync": state.ctx.sync.status(),
    }))
}
