//! Session lifecycle: spawn the CLI, pump its events into envelopes,
//! bridge permission requests, recover dropped sessions.

use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::mpsc;

use ar_cli_client::{
    command_spec, ClientConfig, ClientEvent, CliClient, PermissionEvent, StreamOutput,
};
use ar_domain::TraceEvent;
use ar_protocol::envelope::{
    InterruptData, MetadataData, OutputData, OutputKind, PermissionDecisionAckData,
    PermissionRequestData, ResultData, SessionReadyData, SessionStartData, StatusData,
    UserMessageData,
};
use ar_protocol::{Envelope, SessionStatus};
use ar_transcripts::normalize::json_summary;

use crate::dispatch::RunnerCtx;
use crate::permissions::{decision_payload, timeout_payload};
use crate::registry::SessionEntry;

/// Create the CLI client for a `session_start` and begin pumping events.
pub async fn start(ctx: &RunnerCtx, data: SessionStartData) {
    let session_id = data.session_id.clone();

    if ctx.registry.get(&session_id).is_some() {
        fail(ctx, &session_id, "session already has a live client");
        return;
    }
    if !ctx.config.cli_kinds.contains(&data.cli_kind) {
        fail(
            ctx,
            &session_id,
            &format!("CLI kind {} is not enabled on this runner", data.cli_kind),
        );
        return;
    }

    // Working directory: create on request, otherwise it must exist.
    let cwd = PathBuf::from(&data.cwd);
    if !cwd.is_dir() {
        if data.create_dir {
            if let Err(e) = std::fs::create_dir_all(&cwd) {
                fail(ctx, &session_id, &format!("cannot create {}: {e}", data.cwd));
                return;
            }
        } else {
            fail(ctx, &session_id, &format!("no such directory: {}", data.cwd));
            return;
        }
    }

    let spec = command_spec(
        data.cli_kind,
        data.variant,
        &data.options,
        &cwd,
        &ctx.config.cli_search_paths,
    );
    let client_config = ClientConfig {
        control_timeout: ctx.config.control_timeout(),
        mcp_timeout: ctx.config.mcp_timeout(),
        include_partial_messages: data.options.include_partial_messages,
        ..Default::default()
    };

    let (events_tx, events_rx) = mpsc::channel(256);
    let client = match CliClient::spawn(&spec, client_config, events_tx) {
        Ok(client) => client,
        Err(e) => {
            fail(ctx, &session_id, &format!("failed to spawn {}: {e}", data.cli_kind));
            return;
        }
    };

    TraceEvent::CliSpawned {
        session_id: session_id.clone(),
        program: spec.program.display().to_string(),
    }
    .emit();

    let entry = SessionEntry {
        session_id: session_id.clone(),
        kind: data.cli_kind,
        variant: data.variant,
        cwd,
        created_by: data.user.clone(),
        created_at: Utc::now(),
        client: client.clone(),
    };
    if let Err(e) = ctx.registry.insert(entry, data.clone()) {
        client.shutdown();
        fail(ctx, &session_id, &e.to_string());
        return;
    }

    TraceEvent::SessionStarted {
        session_id: session_id.clone(),
        cli_kind: data.cli_kind.to_string(),
        cwd: data.cwd.clone(),
    }
    .emit();

    let ctx = ctx.clone();
    tokio::spawn(pump(ctx, session_id, client, events_rx));
}

/// Route a user text turn to its session, attempting auto-recovery when
/// the client died but the session is known.
pub async fn user_message(ctx: &RunnerCtx, data: UserMessageData) {
    if ctx.registry.get(&data.session_id).is_none() {
        if let Some(mut blueprint) = ctx.registry.blueprint(&data.session_id) {
            tracing::info!(
                session_id = %data.session_id,
                "client gone but session known, attempting recovery"
            );
            blueprint.options.resume_session_id = Some(data.session_id.clone());
            blueprint.create_dir = false;
            start(ctx, blueprint).await;
        }
    }

    match ctx.registry.get(&data.session_id) {
        Some(entry) => {
            if let Err(e) = entry.client.send_message(&data.text).await {
                fail(ctx, &data.session_id, &format!("send failed: {e}"));
            }
        }
        None => fail(ctx, &data.session_id, "no such session"),
    }
}

/// Explicit `session_end`: kill the client, drop all session state.
pub async fn end(ctx: &RunnerCtx, session_id: &str, reason: &str) {
    if let Some(entry) = ctx.registry.forget(session_id) {
        entry.client.shutdown();
    }
    let cancelled = ctx.broker.cancel_session(session_id);
    if cancelled > 0 {
        tracing::debug!(session_id, cancelled, "cancelled pending permissions");
    }
    TraceEvent::SessionEnded {
        session_id: session_id.to_string(),
        reason: reason.to_string(),
    }
    .emit();
}

pub async fn interrupt(ctx: &RunnerCtx, data: InterruptData) {
    match ctx.registry.get(&data.session_id) {
        Some(entry) => {
            if let Err(e) = entry.client.interrupt().await {
                tracing::warn!(session_id = %data.session_id, error = %e, "interrupt failed");
            }
        }
        None => tracing::debug!(session_id = %data.session_id, "interrupt for unknown session"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event pump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn pump(
    ctx: RunnerCtx,
    session_id: String,
    client: CliClient,
    mut events: mpsc::Receiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Ready {
                model, tools, ..
            } => {
                ctx.link.send(Envelope::SessionReady(SessionReadyData {
                    session_id: session_id.clone(),
                    model,
                    tools,
                }));
            }

            ClientEvent::Status(status) => {
                ctx.link.send(Envelope::Status(StatusData {
                    session_id: session_id.clone(),
                    status,
                    current_tool: None,
                    activity: None,
                }));
            }

            ClientEvent::Output(output) => forward_output(&ctx, &session_id, output),

            ClientEvent::PermissionRequest(request) => {
                let ctx = ctx.clone();
                let client = client.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    bridge_permission(ctx, session_id, client, request).await;
                });
            }

            ClientEvent::TurnFinished {
                is_error,
                duration_ms,
                total_cost_usd,
                summary,
            } => {
                ctx.link.send(Envelope::Result(ResultData {
                    session_id: session_id.clone(),
                    is_error,
                    duration_ms,
                    total_cost_usd,
                    summary,
                }));
            }

            ClientEvent::Exited { code } => {
                TraceEvent::CliExited {
                    session_id: session_id.clone(),
                    exit_code: code,
                }
                .emit();
                ctx.registry.remove(&session_id);
                ctx.broker.cancel_session(&session_id);
                break;
            }
        }
    }
}

fn forward_output(ctx: &RunnerCtx, session_id: &str, output: StreamOutput) {
    match output {
        StreamOutput::Delta { kind, text } => {
            send_output(ctx, session_id, kind, text, None, None);
        }
        StreamOutput::ToolUse {
            tool_use_id,
            name,
            input,
        } => {
            send_output(
                ctx,
                session_id,
                OutputKind::ToolUse,
                json_summary(&input),
                Some(name),
                Some(tool_use_id),
            );
        }
        StreamOutput::Edit {
            tool_use_id,
            tool_name,
            diff,
            ..
        } => {
            send_output(
                ctx,
                session_id,
                OutputKind::Edit,
                diff,
                Some(tool_name),
                Some(tool_use_id),
            );
        }
        StreamOutput::ToolResult {
            tool_use_id,
            tool_name,
            content,
            is_error,
            ..
        } => {
            let kind = if is_error {
                OutputKind::Error
            } else {
                OutputKind::ToolResult
            };
            send_output(ctx, session_id, kind, content, Some(tool_name), Some(tool_use_id));
        }
        StreamOutput::Tokens {
            input_tokens,
            output_tokens,
        } => {
            ctx.link.send(Envelope::Metadata(MetadataData {
                session_id: session_id.to_string(),
                input_tokens,
                output_tokens,
                model: None,
                permission_mode: None,
            }));
        }
        StreamOutput::Activity { label, tool } => {
            let status = ctx
                .registry
                .get(session_id)
                .map(|e| e.client.status())
                .unwrap_or(SessionStatus::Working);
            ctx.link.send(Envelope::Status(StatusData {
                session_id: session_id.to_string(),
                status,
                current_tool: tool,
                activity: label,
            }));
        }
        // Converted to Status events inside the client.
        StreamOutput::Waiting | StreamOutput::TurnDone => {}
    }
}

fn send_output(
    ctx: &RunnerCtx,
    session_id: &str,
    kind: OutputKind,
    content: String,
    tool_name: Option<String>,
    tool_use_id: Option<String>,
) {
    ctx.link.send(Envelope::Output(OutputData {
        session_id: session_id.to_string(),
        kind,
        content,
        tool_name,
        tool_use_id,
        timestamp: Utc::now(),
    }));
}

fn fail(ctx: &RunnerCtx, session_id: &str, message: &str) {
    tracing::warn!(session_id, message, "session error");
    ctx.link.send(Envelope::Status(StatusData {
        session_id: session_id.to_string(),
        status: SessionStatus::Error,
        current_tool: None,
        activity: None,
    }));
    send_output(
        ctx,
        session_id,
        OutputKind::Error,
        message.to_string(),
        None,
        None,
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission bridging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn bridge_permission(
    ctx: RunnerCtx,
    session_id: String,
    client: CliClient,
    request: PermissionEvent,
) {
    let request_id = request.request_id.clone();
    let data = PermissionRequestData {
        request_id: request_id.clone(),
        session_id: session_id.clone(),
        runner_id: ctx.runner_id.clone(),
        tool_name: request.tool_name.clone(),
        tool_input: request.tool_input,
        suggestions: request.suggestions,
        tool_use_id: request.tool_use_id,
        is_plan_mode: request.is_plan_mode,
        is_question: request.is_question,
        blocked_path: request.blocked_path,
        decision_reason: request.decision_reason,
        timestamp: Utc::now(),
    };

    TraceEvent::PermissionRequested {
        request_id: request_id.clone(),
        session_id: session_id.clone(),
        tool_name: request.tool_name.clone(),
    }
    .emit();

    let waiter = ctx.broker.register(data.clone());
    if !ctx.link.send(Envelope::PermissionRequest(data)) {
        tracing::warn!(
            request_id = %request_id,
            "gateway unreachable, permission request will ride the timeout"
        );
    }

    let started = std::time::Instant::now();
    let timeout = ctx.broker.approval_timeout();
    match tokio::time::timeout(timeout, waiter).await {
        // ── Decision arrived ─────────────────────────────────────────
        Ok(Ok(decision)) => {
            let payload = decision_payload(&decision);
            let delivered = client.respond_control(&request_id, Ok(payload)).await;

            TraceEvent::PermissionDecided {
                request_id: request_id.clone(),
                behavior: format!("{:?}", decision.behavior).to_lowercase(),
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .emit();

            let (success, error) = match delivered {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            ctx.link
                .send(Envelope::PermissionDecisionAck(PermissionDecisionAckData {
                    request_id,
                    session_id,
                    success,
                    error,
                }));
        }

        // ── Session closed underneath us ─────────────────────────────
        Ok(Err(_)) => {
            tracing::debug!(request_id = %request_id, "permission waiter cancelled");
        }

        // ── Nobody decided in time ───────────────────────────────────
        Err(_) => {
            ctx.broker.discard(&request_id);
            if let Err(e) = client
                .respond_control(&request_id, Ok(timeout_payload(timeout)))
                .await
            {
                tracing::warn!(request_id = %request_id, error = %e, "failed to deliver timeout denial");
            }
            TraceEvent::PermissionExpired {
                request_id: request_id.clone(),
            }
            .emit();
            ctx.link
                .send(Envelope::PermissionDecisionAck(PermissionDecisionAckData {
                    request_id,
                    session_id,
                    success: false,
                    error: Some(format!("no decision after {}s", timeout.as_secs())),
                }));
        }
    }
}
