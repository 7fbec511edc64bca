//! End-to-end permission and registration flows, driven through the
//! dispatcher and action API with channel-backed runner sinks (no real
//! WebSocket).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use ar_domain::config::GatewayConfig;
use ar_gateway::actions::DecisionResult;
use ar_gateway::dispatch;
use ar_gateway::permissions::PermissionStatus;
use ar_gateway::state::AppState;
use ar_gateway::surface::LoggingSurface;
use ar_protocol::envelope::{
    DecisionBehavior, PermissionDecisionAckData, PermissionRequestData, RegisterData,
};
use ar_protocol::{CliKind, Envelope};

fn app_state() -> AppState {
    AppState::new(
        Arc::new(GatewayConfig::default()),
        Arc::new(LoggingSurface),
    )
}

fn connect(state: &AppState, name: &str, token: &str) -> (String, bool, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(64);
    let (runner_id, reclaimed) = state.runners.register(
        &RegisterData {
            runner_name: name.into(),
            token: token.into(),
            cli_kinds: vec![CliKind::Claude],
            default_workspace: None,
        },
        vec![],
        tx,
    );
    (runner_id, reclaimed, rx)
}

fn bash_request(request_id: &str, runner_id: &str) -> PermissionRequestData {
    PermissionRequestData {
        request_id: request_id.into(),
        session_id: "s1".into(),
        runner_id: runner_id.into(),
        tool_name: "Bash".into(),
        tool_input: serde_json::json!({"command": "ls"}),
        suggestions: vec![],
        tool_use_id: Some("tu_1".into()),
        is_plan_mode: false,
        is_question: false,
        blocked_path: None,
        decision_reason: None,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn happy_path_tool_approval() {
    let state = app_state();
    let (runner_id, _, mut from_gateway) = connect(&state, "dev", "tok");

    // Runner reports a blocked Bash call.
    dispatch::handle_envelope(
        &state,
        &runner_id,
        Envelope::PermissionRequest(bash_request("r1", &runner_id)),
    )
    .await;
    assert_eq!(state.permissions.pending_count(), 1);

    // User clicks approve: the runner receives the decision.
    assert_eq!(
        state.approve_permission("r1", None).await,
        DecisionResult::Sent
    );
    let decision = match from_gateway.try_recv().unwrap() {
        Envelope::PermissionDecision(d) => d,
        other => panic!("unexpected envelope: {}", other.kind()),
    };
    assert_eq!(decision.request_id, "r1");
    assert_eq!(decision.behavior, DecisionBehavior::Allow);

    // Runner acks: store completes, no timers outstanding.
    dispatch::handle_envelope(
        &state,
        &runner_id,
        Envelope::PermissionDecisionAck(PermissionDecisionAckData {
            request_id: "r1".into(),
            session_id: "s1".into(),
            success: true,
            error: None,
        }),
    )
    .await;

    let entry = state.permissions.entry("r1").unwrap();
    assert_eq!(entry.status, PermissionStatus::Completed);
    assert_eq!(state.permissions.ack_timers_outstanding(), 0);
    assert_eq!(state.permissions.pending_count(), 0);

    // A duplicate ack is idempotent.
    dispatch::handle_envelope(
        &state,
        &runner_id,
        Envelope::PermissionDecisionAck(PermissionDecisionAckData {
            request_id: "r1".into(),
            session_id: "s1".into(),
            success: true,
            error: None,
        }),
    )
    .await;
    assert_eq!(
        state.permissions.entry("r1").unwrap().status,
        PermissionStatus::Completed
    );
}

#[tokio::test]
async fn ask_user_question_delivers_one_answer_payload() {
    let state = app_state();
    let (runner_id, _, mut from_gateway) = connect(&state, "dev", "tok");

    // The CLI asked three questions; the surface collected the answers
    // across three interactions and submits them in one go.
    let mut request = bash_request("q1", &runner_id);
    request.tool_name = "AskUserQuestion".into();
    request.is_question = true;
    request.tool_input = serde_json::json!({"questions": [
        {"question": "Favorite color?", "options": ["Blue", "Red"]},
        {"question": "Pick several", "multiSelect": true},
        {"question": "Anything else?"},
    ]});
    dispatch::handle_envelope(&state, &runner_id, Envelope::PermissionRequest(request)).await;

    let answers = serde_json::json!({"questions": [
        {"question": "Favorite color?", "answer": "Blue"},
        {"question": "Pick several", "answer": "Red,Green"},
        {"question": "Anything else?", "answer": "0/custom text"},
    ]});
    assert_eq!(
        state.answer_permission("q1", answers.clone(), None).await,
        DecisionResult::Sent
    );

    match from_gateway.try_recv().unwrap() {
        Envelope::PermissionDecision(d) => {
            assert_eq!(d.behavior, DecisionBehavior::Allow);
            assert_eq!(d.updated_input, Some(answers));
        }
        other => panic!("unexpected envelope: {}", other.kind()),
    }
}

#[tokio::test]
async fn reclaim_keeps_the_runner_id() {
    let state = app_state();
    let (first_id, reclaimed, _rx) = connect(&state, "dev", "token-T");
    assert!(!reclaimed);

    // TCP drop.
    state.runners.mark_offline(&first_id);
    state.sessions.mark_runner_offline(&first_id);

    // Restart with the same token: same id, reclaimed=true.
    let (second_id, reclaimed, _rx2) = connect(&state, "dev", "token-T");
    assert_eq!(first_id, second_id);
    assert!(reclaimed);
    assert!(state.runners.is_online(&second_id));
}

#[tokio::test]
async fn heartbeat_silence_marks_offline_and_orphans_sessions() {
    let state = app_state();
    let (runner_id, _, _rx) = connect(&state, "dev", "tok");

    let session_id = state
        .start_session(
            &runner_id,
            "alice",
            CliKind::Claude,
            Default::default(),
            "/tmp".into(),
            false,
            Default::default(),
        )
        .await
        .unwrap();

    // No heartbeats for over two intervals.
    state.runners.sweep_silent(chrono::Duration::milliseconds(-1));
    let orphaned = state.sessions.mark_runner_offline(&runner_id);
    assert_eq!(orphaned, 1);
    assert_eq!(
        state.sessions.get(&session_id).unwrap().status,
        ar_protocol::SessionStatus::Offline
    );
}

#[tokio::test]
async fn sync_frames_update_the_session_cache() {
    let state = app_state();
    let (runner_id, _, _rx) = connect(&state, "dev", "tok");

    let session = ar_protocol::envelope::SessionPayload {
        session_id: "external-1".into(),
        cli_kind: CliKind::Claude,
        project_path: "/home/u/proj".into(),
        updated_at: Utc::now(),
        messages: vec![],
    };
    dispatch::handle_envelope(
        &state,
        &runner_id,
        Envelope::SyncSessionDiscovered(ar_protocol::envelope::SyncSessionDiscoveredData {
            project_path: "/home/u/proj".into(),
            session,
        }),
    )
    .await;
    assert_eq!(state.sessions.synced_count(), 1);
}
