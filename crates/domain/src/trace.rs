use serde::Serialize;

/// Structured trace events emitted across all AgentRelay crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    RunnerRegistered {
        runner_id: String,
        reclaimed: bool,
    },
    RunnerOffline {
        runner_id: String,
        missed_heartbeats: bool,
    },
    SessionStarted {
        session_id: String,
        cli_kind: String,
        cwd: String,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    CliSpawned {
        session_id: String,
        program: String,
    },
    CliExited {
        session_id: String,
        exit_code: Option<i32>,
    },
    PermissionRequested {
        request_id: String,
        session_id: String,
        tool_name: String,
    },
    PermissionDecided {
        request_id: String,
        behavior: String,
        waited_ms: u64,
    },
    PermissionExpired {
        request_id: String,
    },
    SyncPassCompleted {
        project_path: String,
        sessions_seen: usize,
        changed: usize,
    },
    SyncChunked {
        project_path: String,
        sessions: usize,
        frames: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ar_event");
    }
}
