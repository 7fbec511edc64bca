//! Codex change detection.
//!
//! Codex offers no filesystem to watch, only the cursor-paginated thread
//! listing, so changes are found by polling and diffing `updatedAt`
//! against a cached map. The first pass is a baseline and emits nothing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use ar_protocol::envelope::{
    SessionPayload, SyncSessionDiscoveredData, SyncSessionUpdatedData,
};
use ar_protocol::{CliKind, Envelope};
use ar_transcripts::codex::{self, ThreadSummary};

use crate::dispatch::RunnerCtx;

pub fn spawn(ctx: RunnerCtx, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        run(ctx, interval, shutdown).await;
    });
}

async fn run(ctx: RunnerCtx, interval: Duration, shutdown: CancellationToken) {
    let Some(api) = ctx.sync.codex_api() else {
        return;
    };

    let mut known: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut baseline_done = false;

    loop {
        match codex::list_all_threads(api.as_ref()).await {
            Ok(threads) => {
                for thread in &threads {
                    handle_thread(&ctx, thread, &mut known, baseline_done).await;
                }
                baseline_done = true;
            }
            Err(e) => {
                tracing::debug!(error = %e, "codex poll failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Returns whether the thread was new or changed.
async fn handle_thread(
    ctx: &RunnerCtx,
    thread: &ThreadSummary,
    known: &mut HashMap<String, DateTime<Utc>>,
    emit: bool,
) -> bool {
    let Some(project_path) = thread.project_path.clone() else {
        return false;
    };
    if ctx.sync.is_owned(&thread.id) {
        return false;
    }

    let previous = known.insert(thread.id.clone(), thread.updated_at);
    let is_new = previous.is_none();
    let is_updated = previous.is_some_and(|t| thread.updated_at > t);
    if !(is_new || is_updated) || !emit {
        return is_new || is_updated;
    }

    let Some(api) = ctx.sync.codex_api() else {
        return true;
    };
    match api.read_thread(&thread.id).await {
        Ok(full) => {
            let session = SessionPayload {
                session_id: thread.id.clone(),
                cli_kind: CliKind::Codex,
                project_path: project_path.clone(),
                updated_at: thread.updated_at,
                messages: codex::normalize_thread(&full),
            };
            let envelope = if is_new {
                Envelope::SyncSessionDiscovered(SyncSessionDiscoveredData {
                    project_path,
                    session,
                })
            } else {
                Envelope::SyncSessionUpdated(SyncSessionUpdatedData {
                    project_path,
                    session,
                })
            };
            ctx.link.send(envelope);
        }
        Err(e) => {
            tracing::debug!(thread_id = %thread.id, error = %e, "codex hydration failed");
        }
    }
    true
}
