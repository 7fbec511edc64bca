//! Per-project session watcher.
//!
//! OS file notifications when the platform cooperates, adaptive polling
//! always (notify events only short-circuit the wait). Intervals tighten
//! while a project is hot and relax as it cools: 2 s within 30 s of
//! activity, 10 s within 5 minutes, 60 s when idle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use ar_domain::TraceEvent;
use ar_protocol::envelope::{
    SessionPayload, SyncSessionDiscoveredData, SyncSessionUpdatedData,
};
use ar_protocol::{CliKind, Envelope};
use ar_transcripts::SessionSummary;

use crate::dispatch::RunnerCtx;

/// Activity horizon for the fast polling tier.
const ACTIVE_WINDOW: Duration = Duration::from_secs(30);
/// Activity horizon for the medium tier.
const RECENT_WINDOW: Duration = Duration::from_secs(300);

/// The adaptive interval for a project idle for `idle_for`.
pub fn poll_interval(idle_for: Duration) -> Duration {
    if idle_for <= ACTIVE_WINDOW {
        Duration::from_secs(2)
    } else if idle_for <= RECENT_WINDOW {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(60)
    }
}

/// Watch one project directory until shutdown.
pub fn spawn(ctx: RunnerCtx, project_path: String, shutdown: CancellationToken) {
    tokio::spawn(async move {
        run(ctx, project_path, shutdown).await;
    });
}

async fn run(ctx: RunnerCtx, project_path: String, shutdown: CancellationToken) {
    let wake = Arc::new(Notify::new());

    // Native notifications are an accelerator, not a requirement: on any
    // error we silently fall back to pure polling.
    let _os_watcher = start_os_watcher(&ctx, &project_path, wake.clone());

    let mut last_known: HashMap<(CliKind, String), DateTime<Utc>> = HashMap::new();
    let mut last_activity = tokio::time::Instant::now();
    let mut baseline_done = false;

    loop {
        let changed = check(&ctx, &project_path, &mut last_known, baseline_done).await;
        baseline_done = true;
        if changed > 0 {
            last_activity = tokio::time::Instant::now();
        }

        let interval = poll_interval(last_activity.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {
                // Debounce the burst a single save produces.
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

fn start_os_watcher(
    ctx: &RunnerCtx,
    project_path: &str,
    wake: Arc<Notify>,
) -> Option<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        if result.is_ok() {
            wake.notify_one();
        }
    })
    .ok()?;

    let mut watching = false;
    for dir in watch_dirs(ctx, project_path) {
        if dir.is_dir() && watcher.watch(&dir, RecursiveMode::Recursive).is_ok() {
            watching = true;
        }
    }
    if watching {
        tracing::debug!(project = project_path, "file notifications active");
        Some(watcher)
    } else {
        tracing::debug!(project = project_path, "file notifications unavailable, polling only");
        None
    }
}

fn watch_dirs(ctx: &RunnerCtx, project_path: &str) -> Vec<PathBuf> {
    vec![
        ctx.sync.claude_project_dir(project_path),
        PathBuf::from(project_path).join(".gemini").join("chats"),
    ]
}

/// One scan pass. Returns how many sessions changed.
async fn check(
    ctx: &RunnerCtx,
    project_path: &str,
    last_known: &mut HashMap<(CliKind, String), DateTime<Utc>>,
    emit: bool,
) -> usize {
    let sessions = ctx.sync.list_project_sessions(project_path);
    let mut changed = 0usize;

    for summary in &sessions {
        // Owned sessions stream live through the session pump; syncing
        // them back would echo our own output.
        if ctx.registry.is_owned(&summary.session_id) {
            continue;
        }

        let key = (summary.kind, summary.session_id.clone());
        let known = last_known.get(&key).copied();
        let is_new = known.is_none();
        let is_updated = known.is_some_and(|t| summary.updated_at > t);
        last_known.insert(key, summary.updated_at);

        if !(is_new || is_updated) {
            continue;
        }
        changed += 1;
        if !emit {
            continue; // first pass is the baseline
        }

        match ctx.sync.hydrate(summary).await {
            Some(payload) => {
                send_change(ctx, project_path, payload, is_new);
            }
            None => {
                tracing::debug!(
                    session_id = %summary.session_id,
                    "could not hydrate changed session"
                );
            }
        }
    }

    if changed > 0 && emit {
        TraceEvent::SyncPassCompleted {
            project_path: project_path.to_string(),
            sessions_seen: sessions.len(),
            changed,
        }
        .emit();
    }
    changed
}

fn send_change(ctx: &RunnerCtx, project_path: &str, session: SessionPayload, is_new: bool) {
    let envelope = if is_new {
        Envelope::SyncSessionDiscovered(SyncSessionDiscoveredData {
            project_path: project_path.to_string(),
            session,
        })
    } else {
        Envelope::SyncSessionUpdated(SyncSessionUpdatedData {
            project_path: project_path.to_string(),
            session,
        })
    };
    ctx.link.send(envelope);
}

/// Re-exported for the service; summaries sort stably for determinism.
pub fn sort_summaries(sessions: &mut [SessionSummary]) {
    sessions.sort_by(|a, b| {
        (a.kind.as_str(), &a.session_id).cmp(&(b.kind.as_str(), &b.session_id))
    });
}
