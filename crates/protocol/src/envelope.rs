//! The runner↔gateway message envelope.
//!
//! Wire format: one JSON object per line, `{"type": "<discriminant>",
//! "data": {...}}`. The decoder never fails hard — malformed lines and
//! unknown discriminants are logged and reported as [`Decoded::Skip`] /
//! [`Decoded::Unknown`] so a misbehaving peer cannot take the process down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blocks::StructuredMessage;
use crate::session::{CliKind, PluginVariant, SessionOptions, SessionStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed discriminant set of the runner↔gateway protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    // ── Registration & liveness ──────────────────────────────────
    /// Runner → gateway: identify with the pre-shared token.
    Register(RegisterData),
    /// Gateway → runner: registration accepted.
    Registered(RegisteredData),
    /// Gateway → runner: fatal rejection; the runner exits.
    Error(ErrorData),
    /// Runner → gateway: periodic liveness.
    Heartbeat(HeartbeatData),

    // ── Session lifecycle ────────────────────────────────────────
    SessionStart(SessionStartData),
    SessionReady(SessionReadyData),
    SessionEnd(SessionEndData),
    UserMessage(UserMessageData),

    // ── Streamed session output ──────────────────────────────────
    Output(OutputData),
    Status(StatusData),
    Metadata(MetadataData),
    Result(ResultData),

    // ── Permission bridge ────────────────────────────────────────
    PermissionRequest(PermissionRequestData),
    PermissionDecision(PermissionDecisionData),
    PermissionDecisionAck(PermissionDecisionAckData),
    Interrupt(InterruptData),

    // ── Transcript discovery / sync ──────────────────────────────
    SyncProjects(SyncProjectsData),
    SyncProjectsResponse(SyncProjectsResponseData),
    SyncProjectsProgress(SyncProjectsProgressData),
    SyncProjectsComplete(SyncProjectsCompleteData),
    SyncSessions(SyncSessionsData),
    SyncSessionsResponse(SyncSessionsResponseData),
    SyncSessionsComplete(SyncSessionsCompleteData),
    SyncSessionDiscovered(SyncSessionDiscoveredData),
    SyncSessionUpdated(SyncSessionUpdatedData),

    // ── Chat-surface passthrough ─────────────────────────────────
    /// Runner → gateway: open a new chat thread. Payload shape is owned
    /// by the chat surface and carried opaquely.
    SpawnThread(Value),
    /// Runner → gateway: generic UI action passthrough, also opaque.
    DiscordAction(Value),
}

impl Envelope {
    /// The wire discriminant, for logging and handler registries.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register(_) => "register",
            Envelope::Registered(_) => "registered",
            Envelope::Error(_) => "error",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::SessionStart(_) => "session_start",
            Envelope::SessionReady(_) => "session_ready",
            Envelope::SessionEnd(_) => "session_end",
            Envelope::UserMessage(_) => "user_message",
            Envelope::Output(_) => "output",
            Envelope::Status(_) => "status",
            Envelope::Metadata(_) => "metadata",
            Envelope::Result(_) => "result",
            Envelope::PermissionRequest(_) => "permission_request",
            Envelope::PermissionDecision(_) => "permission_decision",
            Envelope::PermissionDecisionAck(_) => "permission_decision_ack",
            Envelope::Interrupt(_) => "interrupt",
            Envelope::SyncProjects(_) => "sync_projects",
            Envelope::SyncProjectsResponse(_) => "sync_projects_response",
            Envelope::SyncProjectsProgress(_) => "sync_projects_progress",
            Envelope::SyncProjectsComplete(_) => "sync_projects_complete",
            Envelope::SyncSessions(_) => "sync_sessions",
            Envelope::SyncSessionsResponse(_) => "sync_sessions_response",
            Envelope::SyncSessionsComplete(_) => "sync_sessions_complete",
            Envelope::SyncSessionDiscovered(_) => "sync_session_discovered",
            Envelope::SyncSessionUpdated(_) => "sync_session_updated",
            Envelope::SpawnThread(_) => "spawn_thread",
            Envelope::DiscordAction(_) => "discord_action",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    pub runner_name: String,
    pub token: String,
    pub cli_kinds: Vec<CliKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredData {
    pub runner_id: String,
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub runner_id: String,
    pub cli_kinds: Vec<CliKind>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartData {
    pub session_id: String,
    pub cli_kind: CliKind,
    #[serde(default)]
    pub variant: PluginVariant,
    pub cwd: String,
    /// Create the working directory if it does not exist.
    #[serde(default)]
    pub create_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub options: SessionOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReadyData {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndData {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageData {
    pub session_id: String,
    pub text: String,
}

/// Tag on a streamed output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Thinking,
    ToolUse,
    ToolResult,
    Edit,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputData {
    pub session_id: String,
    pub kind: OutputKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataData {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultData {
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestData {
    pub request_id: String,
    pub session_id: String,
    pub runner_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default)]
    pub suggestions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub is_plan_mode: bool,
    #[serde(default)]
    pub is_question: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Allow/deny verdict for a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionBehavior {
    Allow,
    Deny,
}

/// The persistence scope a decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionScope {
    Session,
    LocalSettings,
    UserSettings,
    ProjectSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecisionData {
    pub request_id: String,
    pub behavior: DecisionBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PermissionScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_permissions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    /// When set, the gateway lost its UI state and asks the runner to
    /// re-send the original `permission_request` instead of deciding.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reissue: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecisionAckData {
    pub request_id: String,
    pub session_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptData {
    pub session_id: String,
}

// ── Sync payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SyncProjectsData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub project_path: String,
    pub cli_kind: CliKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsResponseData {
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsProgressData {
    pub message: String,
    pub scanned: usize,
}

/// Outcome tag shared by the `*_complete` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsCompleteData {
    pub status: SyncOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsData {
    pub project_path: String,
}

/// One session with fully normalized messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub session_id: String,
    pub cli_kind: CliKind,
    pub project_path: String,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<StructuredMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsResponseData {
    pub project_path: String,
    pub sessions: Vec<SessionPayload>,
    /// 0-based index of this frame within the chunked reply.
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsCompleteData {
    pub project_path: String,
    pub status: SyncOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionDiscoveredData {
    pub project_path: String,
    pub session: SessionPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionUpdatedData {
    pub project_path: String,
    pub session: SessionPayload,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Line codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of decoding one wire line.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed envelope from the closed set.
    Envelope(Box<Envelope>),
    /// Valid JSON with a `type` we don't know (or a payload we couldn't
    /// read). Preserved raw so callers can log or forward it.
    Unknown { kind: String, raw: String },
    /// Empty line or irrecoverable garbage; already logged.
    Skip,
}

/// Decode a single newline-delimited frame. Never panics, never errors:
/// anything that is not a known envelope is logged and classified.
pub fn decode_line(line: &str) -> Decoded {
    let line = line.trim();
    if line.is_empty() {
        return Decoded::Skip;
    }

    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => Decoded::Envelope(Box::new(envelope)),
        Err(parse_err) => match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                let kind = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if kind.is_empty() {
                    tracing::warn!(
                        snippet = %snippet(line),
                        error = %parse_err,
                        "envelope without a type discriminant, dropping"
                    );
                    Decoded::Skip
                } else {
                    tracing::warn!(
                        kind = %kind,
                        snippet = %snippet(line),
                        "unrecognized envelope, dropping"
                    );
                    Decoded::Unknown {
                        kind,
                        raw: line.to_string(),
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    snippet = %snippet(line),
                    error = %parse_err,
                    "non-JSON frame on wire, dropping"
                );
                Decoded::Skip
            }
        },
    }
}

/// Serialize an envelope as one newline-terminated frame.
pub fn encode_line(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(envelope)?;
    json.push('\n');
    Ok(json)
}

/// First ~200 chars of a line, safe on char boundaries.
fn snippet(line: &str) -> &str {
    let mut end = line.len().min(200);
    while end < line.len() && !line.is_char_boundary(end) {
        end += 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::PermissionRequest(PermissionRequestData {
            request_id: "r1".into(),
            session_id: "s1".into(),
            runner_id: "runner_dev_abc123def456".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "ls"}),
            suggestions: vec![],
            tool_use_id: Some("tu_1".into()),
            is_plan_mode: false,
            is_question: false,
            blocked_path: None,
            decision_reason: None,
            timestamp: Utc::now(),
        });

        let line = encode_line(&envelope).unwrap();
        assert!(line.ends_with('\n'));
        match decode_line(&line) {
            Decoded::Envelope(back) => assert_eq!(*back, envelope),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn wire_shape_uses_type_and_data() {
        let envelope = Envelope::SessionEnd(SessionEndData {
            session_id: "s1".into(),
        });
        let value: Value = serde_json::from_str(encode_line(&envelope).unwrap().trim()).unwrap();
        assert_eq!(value["type"], "session_end");
        assert_eq!(value["data"]["sessionId"], "s1");
    }

    #[test]
    fn empty_lines_skip() {
        assert!(matches!(decode_line(""), Decoded::Skip));
        assert!(matches!(decode_line("   \r"), Decoded::Skip));
    }

    #[test]
    fn garbage_skips_without_panicking() {
        assert!(matches!(decode_line("not json at all"), Decoded::Skip));
        assert!(matches!(decode_line("{\"truncated\":"), Decoded::Skip));
    }

    #[test]
    fn unknown_discriminant_is_preserved() {
        let line = r#"{"type":"telemetry_v2","data":{"x":1}}"#;
        match decode_line(line) {
            Decoded::Unknown { kind, raw } => {
                assert_eq!(kind, "telemetry_v2");
                assert_eq!(raw, line);
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let line = r#"{"type":"user_message","data":{"sessionId":"s1","text":"hi","newField":42}}"#;
        match decode_line(line) {
            Decoded::Envelope(env) => match *env {
                Envelope::UserMessage(data) => {
                    assert_eq!(data.session_id, "s1");
                    assert_eq!(data.text, "hi");
                }
                other => panic!("wrong variant: {other:?}"),
            },
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn decision_reissue_flag_is_optional_on_the_wire() {
        let line = r#"{"type":"permission_decision","data":{"requestId":"r1","behavior":"allow"}}"#;
        match decode_line(line) {
            Decoded::Envelope(env) => match *env {
                Envelope::PermissionDecision(data) => {
                    assert!(!data.reissue);
                    assert_eq!(data.behavior, DecisionBehavior::Allow);
                }
                other => panic!("wrong variant: {other:?}"),
            },
            other => panic!("expected envelope, got {other:?}"),
        }

        let plain = Envelope::PermissionDecision(PermissionDecisionData {
            request_id: "r1".into(),
            behavior: DecisionBehavior::Deny,
            scope: None,
            updated_permissions: None,
            updated_input: None,
            custom_message: None,
            reissue: false,
        });
        let json = encode_line(&plain).unwrap();
        assert!(!json.contains("reissue"));
    }

    #[test]
    fn passthrough_payloads_stay_opaque() {
        let line = r#"{"type":"spawn_thread","data":{"channelId":"c9","anything":["goes"]}}"#;
        match decode_line(line) {
            Decoded::Envelope(env) => match *env {
                Envelope::SpawnThread(value) => {
                    assert_eq!(value["channelId"], "c9");
                }
                other => panic!("wrong variant: {other:?}"),
            },
            other => panic!("expected envelope, got {other:?}"),
        }
    }
}
