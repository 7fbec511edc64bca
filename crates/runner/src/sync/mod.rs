//! Transcript sync service.
//!
//! Three flows share this module:
//! - per-project watchers ([`watcher`]) push `sync_session_discovered` /
//!   `sync_session_updated` as stores change on disk;
//! - explicit `sync_projects` / `sync_sessions` requests are answered
//!   single-flight per scope, with session replies chunked under the
//!   configured frame budget;
//! - a slow poll loop ([`codex_poll`]) covers Codex, whose store exposes
//!   no filesystem to watch.

pub mod chunk;
pub mod codex_poll;
pub mod watcher;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use ar_domain::TraceEvent;
use ar_protocol::envelope::{
    ProjectInfo, SessionPayload, SyncOutcome, SyncProjectsCompleteData, SyncProjectsProgressData,
    SyncProjectsResponseData, SyncSessionsCompleteData, SyncSessionsResponseData,
};
use ar_protocol::{CliKind, Envelope};
use ar_transcripts::claude::ClaudeStore;
use ar_transcripts::codex::{self, CodexApi};
use ar_transcripts::gemini::GeminiStore;
use ar_transcripts::SessionSummary;

use crate::link::LinkHandle;
use crate::registry::SessionRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_sync_at: None,
            last_error: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SyncService {
    claude: ClaudeStore,
    gemini: GeminiStore,
    codex: Option<Arc<dyn CodexApi>>,
    registry: Arc<SessionRegistry>,
    /// Projects probed for Gemini chats (Gemini stores live inside the
    /// project root, so there is nothing global to enumerate).
    gemini_projects: Vec<PathBuf>,
    max_chunk_bytes: usize,

    projects_inflight: AtomicBool,
    sessions_inflight: Mutex<HashSet<String>>,
    status: Mutex<SyncStatus>,
}

impl SyncService {
    pub fn new(
        claude: ClaudeStore,
        gemini: GeminiStore,
        codex: Option<Arc<dyn CodexApi>>,
        registry: Arc<SessionRegistry>,
        gemini_projects: Vec<PathBuf>,
        max_chunk_bytes: usize,
    ) -> Self {
        Self {
            claude,
            gemini,
            codex,
            registry,
            gemini_projects,
            max_chunk_bytes,
            projects_inflight: AtomicBool::new(false),
            sessions_inflight: Mutex::new(HashSet::new()),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub fn codex_api(&self) -> Option<Arc<dyn CodexApi>> {
        self.codex.clone()
    }

    pub(crate) fn claude_project_dir(&self, project_path: &str) -> PathBuf {
        self.claude.project_dir(project_path)
    }

    // ── Watcher support ──────────────────────────────────────────────

    /// Filesystem-visible sessions of a project (Claude + Gemini), in a
    /// stable order.
    pub fn list_project_sessions(&self, project_path: &str) -> Vec<SessionSummary> {
        let mut sessions = Vec::new();
        match self.claude.list_sessions(project_path) {
            Ok(found) => sessions.extend(found),
            Err(e) => tracing::debug!(project = project_path, error = %e, "claude listing failed"),
        }
        match self.gemini.list_sessions(std::path::Path::new(project_path)) {
            Ok(found) => sessions.extend(found),
            Err(e) => tracing::debug!(project = project_path, error = %e, "gemini listing failed"),
        }
        watcher::sort_summaries(&mut sessions);
        sessions
    }

    /// Load the full normalized transcript behind a summary.
    pub async fn hydrate(&self, summary: &SessionSummary) -> Option<SessionPayload> {
        let messages = match summary.kind {
            CliKind::Claude => self
                .claude
                .read_session(&summary.project_path, &summary.session_id)
                .ok()?,
            CliKind::Gemini => self
                .gemini
                .read_session(
                    std::path::Path::new(&summary.project_path),
                    &summary.session_id,
                )
                .ok()?,
            CliKind::Codex => {
                let api = self.codex.as_ref()?;
                let thread = api.read_thread(&summary.session_id).await.ok()?;
                codex::normalize_thread(&thread)
            }
        };
        Some(SessionPayload {
            session_id: summary.session_id.clone(),
            cli_kind: summary.kind,
            project_path: summary.project_path.clone(),
            updated_at: summary.updated_at,
            messages,
        })
    }

    // ── Explicit sync: projects ──────────────────────────────────────

    /// Answer a `sync_projects` request. Single-flight: a second request
    /// while one runs is dropped.
    pub async fn sync_projects(&self, link: &LinkHandle) {
        if self.projects_inflight.swap(true, Ordering::SeqCst) {
            tracing::debug!("sync_projects already in flight, dropping duplicate");
            return;
        }
        let started_at = Utc::now();
        self.status.lock().state = SyncState::Syncing;

        let result = self.collect_projects(link).await;
        let completed_at = Utc::now();

        let (status, error) = match result {
            Ok(projects) => {
                link.send(Envelope::SyncProjectsResponse(SyncProjectsResponseData {
                    projects,
                }));
                (SyncOutcome::Success, None)
            }
            Err(e) => (SyncOutcome::Error, Some(e)),
        };
        link.send(Envelope::SyncProjectsComplete(SyncProjectsCompleteData {
            status,
            error: error.clone(),
            started_at,
            completed_at,
        }));

        {
            let mut s = self.status.lock();
            s.state = if error.is_some() {
                SyncState::Error
            } else {
                SyncState::Idle
            };
            s.last_sync_at = Some(completed_at);
            s.last_error = error;
        }
        self.projects_inflight.store(false, Ordering::SeqCst);
    }

    async fn collect_projects(&self, link: &LinkHandle) -> Result<Vec<ProjectInfo>, String> {
        let mut projects = Vec::new();

        let claude_projects = self
            .claude
            .list_projects()
            .map_err(|e| format!("claude store: {e}"))?;
        for (project_path, session_count) in claude_projects {
            projects.push(ProjectInfo {
                project_path,
                cli_kind: CliKind::Claude,
                session_count: Some(session_count),
            });
        }
        link.send(Envelope::SyncProjectsProgress(SyncProjectsProgressData {
            message: "claude store scanned".into(),
            scanned: projects.len(),
        }));

        if let Some(api) = &self.codex {
            let threads = codex::list_all_threads(api.as_ref())
                .await
                .map_err(|e| format!("codex listing: {e}"))?;
            for (project_path, threads) in codex::threads_by_project(&threads) {
                projects.push(ProjectInfo {
                    project_path,
                    cli_kind: CliKind::Codex,
                    session_count: Some(threads.len()),
                });
            }
        }

        for project in &self.gemini_projects {
            if self.gemini.has_sessions(project) {
                let count = self
                    .gemini
                    .list_sessions(project)
                    .map(|s| s.len())
                    .unwrap_or(0);
                projects.push(ProjectInfo {
                    project_path: project.to_string_lossy().into_owned(),
                    cli_kind: CliKind::Gemini,
                    session_count: Some(count),
                });
            }
        }

        Ok(projects)
    }

    // ── Explicit sync: sessions of one project ───────────────────────

    /// Answer a `sync_sessions` request for one project, chunking the
    /// reply under the frame budget. Single-flight per project path.
    pub async fn sync_sessions(&self, link: &LinkHandle, project_path: String) {
        if !self.sessions_inflight.lock().insert(project_path.clone()) {
            tracing::debug!(project = %project_path, "sync_sessions already in flight, dropping");
            return;
        }

        let result = self.collect_sessions(&project_path).await;
        match result {
            Ok(sessions) => {
                let session_count = sessions.len();
                let chunks = chunk::chunk_sessions(sessions, self.max_chunk_bytes);
                TraceEvent::SyncChunked {
                    project_path: project_path.clone(),
                    sessions: session_count,
                    frames: chunks.len(),
                }
                .emit();

                for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                    link.send(Envelope::SyncSessionsResponse(SyncSessionsResponseData {
                        project_path: project_path.clone(),
                        sessions: chunk,
                        chunk_index,
                    }));
                }
                link.send(Envelope::SyncSessionsComplete(SyncSessionsCompleteData {
                    project_path: project_path.clone(),
                    status: SyncOutcome::Success,
                    error: None,
                    session_count,
                }));
            }
            Err(e) => {
                link.send(Envelope::SyncSessionsComplete(SyncSessionsCompleteData {
                    project_path: project_path.clone(),
                    status: SyncOutcome::Error,
                    error: Some(e),
                    session_count: 0,
                }));
            }
        }

        self.sessions_inflight.lock().remove(&project_path);
    }

    async fn collect_sessions(&self, project_path: &str) -> Result<Vec<SessionPayload>, String> {
        let mut payloads = Vec::new();

        for summary in self.list_project_sessions(project_path) {
            match self.hydrate(&summary).await {
                Some(payload) => payloads.push(payload),
                None => tracing::warn!(
                    session_id = %summary.session_id,
                    "skipping session that failed to hydrate"
                ),
            }
        }

        // Codex listings omit turns entirely; hydration is a second call
        // per thread by construction.
        if let Some(api) = &self.codex {
            let threads = codex::list_all_threads(api.as_ref())
                .await
                .map_err(|e| format!("codex listing: {e}"))?;
            for thread in threads {
                if thread.project_path.as_deref() != Some(project_path) {
                    continue;
                }
                match api.read_thread(&thread.id).await {
                    Ok(full) => payloads.push(SessionPayload {
                        session_id: thread.id.clone(),
                        cli_kind: CliKind::Codex,
                        project_path: project_path.to_string(),
                        updated_at: thread.updated_at,
                        messages: codex::normalize_thread(&full),
                    }),
                    Err(e) => {
                        tracing::warn!(thread_id = %thread.id, error = %e, "codex hydration failed");
                    }
                }
            }
        }

        Ok(payloads)
    }

    /// Owned-session check used by the pollers.
    pub fn is_owned(&self, session_id: &str) -> bool {
        self.registry.is_owned(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_transcripts::escape::escape_project_path;

    fn service_with_store(root: &std::path::Path) -> SyncService {
        SyncService::new(
            ClaudeStore::new(root.to_path_buf()),
            GeminiStore::new(),
            None,
            Arc::new(SessionRegistry::new()),
            Vec::new(),
            2 * 1024 * 1024,
        )
    }

    fn seed_claude(root: &std::path::Path, project: &str, session_id: &str) {
        let dir = root.join(escape_project_path(project));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("sessions-index.json"),
            serde_json::json!({"projectPath": project}).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.join(format!("{session_id}.jsonl")),
            r#"{"type":"user","uuid":"u1","message":{"content":"hello"}}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn sync_projects_lists_the_claude_store() {
        let dir = tempfile::tempdir().unwrap();
        seed_claude(dir.path(), "/home/u/proj", "s1");
        let service = service_with_store(dir.path());
        let (link, mut rx) = LinkHandle::test_pair();

        service.sync_projects(&link).await;

        let mut saw_response = false;
        let mut saw_complete = false;
        while let Ok(envelope) = rx.try_recv() {
            match envelope {
                Envelope::SyncProjectsResponse(data) => {
                    assert_eq!(data.projects.len(), 1);
                    assert_eq!(data.projects[0].project_path, "/home/u/proj");
                    assert_eq!(data.projects[0].session_count, Some(1));
                    saw_response = true;
                }
                Envelope::SyncProjectsComplete(data) => {
                    assert_eq!(data.status, SyncOutcome::Success);
                    assert!(data.completed_at >= data.started_at);
                    saw_complete = true;
                }
                Envelope::SyncProjectsProgress(_) => {}
                other => panic!("unexpected envelope: {}", other.kind()),
            }
        }
        assert!(saw_response && saw_complete);
        assert_eq!(service.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn sync_sessions_replies_chunked_then_complete() {
        let dir = tempfile::tempdir().unwrap();
        seed_claude(dir.path(), "/home/u/proj", "s1");
        seed_claude(dir.path(), "/home/u/proj", "s2");
        let service = service_with_store(dir.path());
        let (link, mut rx) = LinkHandle::test_pair();

        service.sync_sessions(&link, "/home/u/proj".into()).await;

        let mut frames = 0;
        let mut complete = None;
        while let Ok(envelope) = rx.try_recv() {
            match envelope {
                Envelope::SyncSessionsResponse(data) => {
                    assert_eq!(data.chunk_index, frames);
                    assert!(!data.sessions.is_empty());
                    frames += 1;
                }
                Envelope::SyncSessionsComplete(data) => complete = Some(data),
                other => panic!("unexpected envelope: {}", other.kind()),
            }
        }
        let complete = complete.expect("complete envelope");
        assert_eq!(complete.status, SyncOutcome::Success);
        assert_eq!(complete.session_count, 2);
        assert!(frames >= 1);
    }

    #[tokio::test]
    async fn missing_project_yields_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_store(dir.path());
        let (link, mut rx) = LinkHandle::test_pair();

        service.sync_sessions(&link, "/nowhere".into()).await;

        let mut complete = None;
        while let Ok(envelope) = rx.try_recv() {
            if let Envelope::SyncSessionsComplete(data) = envelope {
                complete = Some(data);
            }
        }
        let complete = complete.expect("complete envelope");
        assert_eq!(complete.status, SyncOutcome::Success);
        assert_eq!(complete.session_count, 0);
    }

    #[test]
    fn projects_guard_is_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_store(dir.path());
        assert!(!service.projects_inflight.swap(true, Ordering::SeqCst));
        // A concurrent entry observes the guard taken.
        assert!(service.projects_inflight.swap(true, Ordering::SeqCst));
        service.projects_inflight.store(false, Ordering::SeqCst);
    }
}
