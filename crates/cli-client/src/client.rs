//! Per-session stream-JSON client.
//!
//! Owns the CLI child, decodes its stdout, drives the streaming state
//! machine, and correlates control requests/responses by request id.
//! External callers interact through async methods on a cloneable handle;
//! everything the CLI produces comes back on the typed event channel given
//! to [`CliClient::start`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use ar_domain::{Error, Result};
use ar_protocol::SessionStatus;

use crate::process::{CliProcess, CommandSpec, ProcessEvent};
use crate::protocol::{
    self, CliMessage, ControlRequestBody, ControlResponseBody, StreamEvent, TurnResult,
};
use crate::stream::{StreamEngine, StreamOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration & events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handlers for control requests the client can satisfy locally (hook
/// callbacks, MCP messages). The defaults answer nothing, which makes the
/// client fall back to a safe empty response after the timeout.
#[async_trait]
pub trait LocalControlHandler: Send + Sync {
    async fn hook_callback(&self, _callback_id: Option<String>) -> Option<Value> {
        None
    }

    async fn mcp_message(&self, _server_name: Option<String>, _message: Option<Value>) -> Option<Value> {
        None
    }
}

/// No local handlers; every hook/MCP request gets the timeout default.
pub struct NoLocalHandlers;

#[async_trait]
impl LocalControlHandler for NoLocalHandlers {}

#[derive(Clone)]
pub struct ClientConfig {
    pub control_timeout: Duration,
    pub mcp_timeout: Duration,
    /// Whether the CLI was started with partial-message streaming. When
    /// off, completed `assistant` messages are the only output source.
    pub include_partial_messages: bool,
    pub local_handlers: Arc<dyn LocalControlHandler>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(5),
            mcp_timeout: Duration::from_secs(2),
            include_partial_messages: true,
            local_handlers: Arc::new(NoLocalHandlers),
        }
    }
}

/// A tool-permission request the CLI is blocked on.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionEvent {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub suggestions: Vec<Value>,
    pub tool_use_id: Option<String>,
    pub blocked_path: Option<String>,
    pub decision_reason: Option<String>,
    pub is_question: bool,
    pub is_plan_mode: bool,
}

/// Everything a session task can observe about its CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Emitted exactly once, from the init message or the first
    /// successful write, whichever happens first.
    Ready {
        session_id: Option<String>,
        model: Option<String>,
        tools: Vec<String>,
    },
    Output(StreamOutput),
    Status(SessionStatus),
    PermissionRequest(PermissionEvent),
    TurnFinished {
        is_error: bool,
        duration_ms: Option<u64>,
        total_cost_usd: Option<f64>,
        summary: Option<String>,
    },
    Exited {
        code: Option<i32>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ClientState {
    status: SessionStatus,
    queue: VecDeque<String>,
}

struct Inner {
    process: CliProcess,
    config: ClientConfig,
    events: mpsc::Sender<ClientEvent>,
    state: Mutex<ClientState>,
    /// Outbound control requests awaiting a `control_response`.
    pending: Mutex<HashMap<String, oneshot::Sender<ControlResponseBody>>>,
    ready: AtomicBool,
    next_request_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

/// Cloneable handle to one CLI session.
#[derive(Clone)]
pub struct CliClient {
    inner: Arc<Inner>,
}

impl CliClient {
    /// Spawn the CLI described by `spec` and start driving it.
    pub fn spawn(
        spec: &CommandSpec,
        config: ClientConfig,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<Self> {
        let (process, process_events) =
            CliProcess::spawn(spec).map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self::start(process, process_events, config, events))
    }

    /// Attach to an already-spawned process (used by tests and by tmux
    /// re-attachment, where the channel pre-exists).
    pub fn start(
        process: CliProcess,
        process_events: mpsc::Receiver<ProcessEvent>,
        config: ClientConfig,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let inner = Arc::new(Inner {
            process,
            config,
            events,
            state: Mutex::new(ClientState {
                status: SessionStatus::Starting,
                queue: VecDeque::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            next_request_id: AtomicU64::new(0),
            session_id: Mutex::new(None),
        });

        tokio::spawn(drive(inner.clone(), process_events));

        Self { inner }
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.process.is_alive()
    }

    /// Send one user text turn. If a previous turn is still processing the
    /// message is queued and drained FIFO on the next `result`.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let line = protocol::user_message_line(text).map_err(Error::Json)?;

        let queued = {
            let mut state = self.inner.state.lock();
            match state.status {
                SessionStatus::Working | SessionStatus::Waiting => {
                    state.queue.push_back(line.clone());
                    true
                }
                _ => {
                    state.status = SessionStatus::Working;
                    false
                }
            }
        };
        if queued {
            tracing::debug!(
                queued = self.queued_messages(),
                "session busy, queueing message"
            );
            return Ok(());
        }

        self.inner.write_line(line).await?;
        self.inner.emit(ClientEvent::Status(SessionStatus::Working)).await;

        // Readiness race: if init never showed up, a successful write
        // plus a 100 ms grace period counts as ready.
        if !self.inner.ready.load(Ordering::SeqCst) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Inner::mark_ready(&inner, None, None, Vec::new()).await;
            });
        }
        Ok(())
    }

    /// Ctrl-C-equivalent: asks the CLI to abandon the current turn.
    pub async fn interrupt(&self) -> Result<()> {
        self.send_control(ControlRequestBody::Interrupt).await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.send_control(ControlRequestBody::SetPermissionMode { mode: mode.into() })
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.send_control(ControlRequestBody::SetModel { model }).await?;
        Ok(())
    }

    pub async fn set_max_thinking_tokens(&self, max_thinking_tokens: Option<u32>) -> Result<()> {
        self.send_control(ControlRequestBody::SetMaxThinkingTokens { max_thinking_tokens })
            .await?;
        Ok(())
    }

    /// Send a control request and wait for the matching response.
    pub async fn send_control(&self, body: ControlRequestBody) -> Result<ControlResponseBody> {
        let timeout = match body {
            ControlRequestBody::McpMessage { .. } => self.inner.config.mcp_timeout,
            _ => self.inner.config.control_timeout,
        };

        let request_id = format!(
            "req_{}",
            self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        let line = protocol::control_request_line(&request_id, &body).map_err(Error::Json)?;
        if let Err(e) = self.inner.write_line(line).await {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("CLI exited before responding".into())),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "control request {request_id} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Answer a control request the CLI is waiting on (permission
    /// decisions from the gateway land here).
    pub async fn respond_control(
        &self,
        request_id: &str,
        outcome: std::result::Result<Value, String>,
    ) -> Result<()> {
        let body = match outcome {
            Ok(payload) => ControlResponseBody::Success {
                request_id: request_id.to_string(),
                response: Some(payload),
            },
            Err(message) => ControlResponseBody::Error {
                request_id: request_id.to_string(),
                error: message,
            },
        };
        let line = protocol::control_response_line(&body).map_err(Error::Json)?;
        self.inner.write_line(line).await
    }

    /// Kill the CLI. Pending control correlations fail recoverably once
    /// the exit event lands.
    pub fn shutdown(&self) {
        self.inner.process.kill();
    }
}

impl Inner {
    async fn write_line(&self, line: String) -> Result<()> {
        self.process
            .write_line(line)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }

    /// Transition and emit, at most once per distinct status.
    async fn set_status(self: &Arc<Self>, status: SessionStatus) {
        let changed = {
            let mut state = self.state.lock();
            if state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        };
        if changed {
            self.emit(ClientEvent::Status(status)).await;
        }
    }

    /// At-most-once readiness, from init or the write race.
    async fn mark_ready(
        self: &Arc<Self>,
        session_id: Option<String>,
        model: Option<String>,
        tools: Vec<String>,
    ) {
        if self.ready.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = &session_id {
            *self.session_id.lock() = Some(id.clone());
        }
        let session_id = session_id.or_else(|| self.session_id.lock().clone());

        // Don't regress an already-working session back to Ready.
        {
            let mut state = self.state.lock();
            if state.status == SessionStatus::Starting {
                state.status = SessionStatus::Ready;
            }
        }
        self.emit(ClientEvent::Ready {
            session_id,
            model,
            tools,
        })
        .await;
        let status = self.state.lock().status;
        self.emit(ClientEvent::Status(status)).await;
    }

    async fn respond_success(self: &Arc<Self>, request_id: &str, payload: Value) {
        let body = ControlResponseBody::Success {
            request_id: request_id.to_string(),
            response: Some(payload),
        };
        match protocol::control_response_line(&body) {
            Ok(line) => {
                if let Err(e) = self.write_line(line).await {
                    tracing::debug!(error = %e, request_id, "failed to deliver control response");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode control response"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn drive(inner: Arc<Inner>, mut process_events: mpsc::Receiver<ProcessEvent>) {
    let mut engine = StreamEngine::new();
    // Tick well under the flush window so batches land close to on time.
    let mut flush = tokio::time::interval(Duration::from_millis(100));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = process_events.recv() => match event {
                Some(ProcessEvent::Line(line)) => {
                    handle_line(&inner, &mut engine, &line).await;
                }
                Some(ProcessEvent::Stderr(_)) => {
                    // Already logged at debug by the process layer.
                }
                Some(ProcessEvent::Exited(code)) => {
                    on_exit(&inner, &mut engine, code).await;
                    break;
                }
                None => {
                    on_exit(&inner, &mut engine, None).await;
                    break;
                }
            },
            _ = flush.tick() => {
                let mut out = Vec::new();
                engine.flush_due(&mut out);
                emit_outputs(&inner, out).await;
            }
        }
    }
}

/// First ~200 chars of a line, safe on char boundaries.
fn snippet(line: &str) -> &str {
    let mut end = line.len().min(200);
    while end < line.len() && !line.is_char_boundary(end) {
        end += 1;
    }
    &line[..end]
}

async fn handle_line(inner: &Arc<Inner>, engine: &mut StreamEngine, line: &str) {
    let message: CliMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, snippet = %snippet(line), "unparseable CLI line, skipping");
            return;
        }
    };

    match message {
        CliMessage::System(system) => {
            if system.subtype == "init" {
                Inner::mark_ready(
                    inner,
                    system.session_id.clone(),
                    system.model.clone(),
                    system.tools.clone(),
                )
                .await;
            } else {
                tracing::debug!(subtype = %system.subtype, "system message");
            }
        }

        CliMessage::StreamEvent(wrapped) => {
            if matches!(wrapped.event, StreamEvent::MessageStart { .. }) {
                inner.set_status(SessionStatus::Working).await;
            }
            let mut out = Vec::new();
            engine.on_event(&wrapped.event, &mut out);
            emit_outputs(inner, out).await;
        }

        CliMessage::Assistant(envelope) => {
            if !inner.config.include_partial_messages {
                let mut out = Vec::new();
                engine.on_assistant_turn(&envelope.message, &mut out);
                emit_outputs(inner, out).await;
            }
            // With partial messages on, the stream events already carried
            // this turn; the completed message is bookkeeping only.
        }

        CliMessage::User(envelope) => {
            let mut out = Vec::new();
            for result in envelope.message.tool_results() {
                let text = protocol::tool_result_text(&result.content);
                if !engine.on_tool_result(&result.tool_use_id, &text, result.is_error, &mut out) {
                    tracing::debug!(
                        tool_use_id = %result.tool_use_id,
                        "tool result without a matching tool use, dropping"
                    );
                }
            }
            emit_outputs(inner, out).await;
        }

        CliMessage::ControlRequest(request) => {
            handle_control_request(inner, request.request_id, request.request).await;
        }

        CliMessage::ControlResponse(envelope) => {
            let request_id = envelope.response.request_id().to_string();
            match inner.pending.lock().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(envelope.response);
                }
                None => {
                    tracing::debug!(
                        request_id = %request_id,
                        "control response without a pending request, dropping"
                    );
                }
            }
        }

        CliMessage::Result(result) => {
            handle_result(inner, result).await;
        }

        CliMessage::KeepAlive => {}

        CliMessage::Unknown => {
            tracing::debug!(snippet = %snippet(line), "unknown CLI message type");
        }
    }
}

async fn handle_control_request(inner: &Arc<Inner>, request_id: String, body: ControlRequestBody) {
    match body {
        ControlRequestBody::CanUseTool {
            tool_name,
            input,
            permission_suggestions,
            tool_use_id,
            blocked_path,
            decision_reason,
        } => {
            let is_question = tool_name == "AskUserQuestion";
            let is_plan_mode = tool_name == "ExitPlanMode";
            inner
                .emit(ClientEvent::PermissionRequest(PermissionEvent {
                    request_id,
                    tool_name,
                    tool_input: input,
                    suggestions: permission_suggestions.unwrap_or_default(),
                    tool_use_id,
                    blocked_path,
                    decision_reason,
                    is_question,
                    is_plan_mode,
                }))
                .await;
        }

        ControlRequestBody::HookCallback { callback_id, .. } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let payload = tokio::time::timeout(
                    inner.config.control_timeout,
                    inner.config.local_handlers.hook_callback(callback_id),
                )
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| serde_json::json!({}));
                inner.respond_success(&request_id, payload).await;
            });
        }

        ControlRequestBody::McpMessage {
            server_name,
            message,
        } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let payload = tokio::time::timeout(
                    inner.config.mcp_timeout,
                    inner.config.local_handlers.mcp_message(server_name, message),
                )
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| serde_json::json!({}));
                inner.respond_success(&request_id, payload).await;
            });
        }

        // These subtypes normally flow outward; a CLI echoing them back
        // gets a benign success so it never hangs on us.
        other => {
            tracing::debug!(request_id = %request_id, body = ?other, "acknowledging unexpected control request");
            inner.respond_success(&request_id, serde_json::json!({})).await;
        }
    }
}

async fn handle_result(inner: &Arc<Inner>, result: TurnResult) {
    inner
        .emit(ClientEvent::TurnFinished {
            is_error: result.is_error,
            duration_ms: result.duration_ms,
            total_cost_usd: result.total_cost_usd,
            summary: result.result.clone(),
        })
        .await;
    if let Some(usage) = result.usage {
        inner
            .emit(ClientEvent::Output(StreamOutput::Tokens {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }))
            .await;
    }

    // Drain the FIFO queue: the next message starts a new turn
    // immediately, otherwise the session settles to idle/error.
    let next = {
        let mut state = inner.state.lock();
        match state.queue.pop_front() {
            Some(line) => {
                state.status = SessionStatus::Working;
                Some(line)
            }
            None => {
                state.status = if result.is_error {
                    SessionStatus::Error
                } else {
                    SessionStatus::Idle
                };
                None
            }
        }
    };

    match next {
        Some(line) => {
            if let Err(e) = inner.write_line(line).await {
                tracing::warn!(error = %e, "failed to drain queued message");
            }
            inner.emit(ClientEvent::Status(SessionStatus::Working)).await;
        }
        None => {
            let status = inner.state.lock().status;
            inner.emit(ClientEvent::Status(status)).await;
        }
    }
}

async fn emit_outputs(inner: &Arc<Inner>, outputs: Vec<StreamOutput>) {
    for output in outputs {
        match output {
            StreamOutput::Waiting => {
                inner.set_status(SessionStatus::Waiting).await;
            }
            StreamOutput::TurnDone => {
                // `result` owns the idle transition when it arrives; the
                // stream-level stop only settles non-waiting sessions.
                let waiting = inner.state.lock().status == SessionStatus::Waiting;
                if !waiting {
                    inner.set_status(SessionStatus::Idle).await;
                }
            }
            other => inner.emit(ClientEvent::Output(other)).await,
        }
    }
}

async fn on_exit(inner: &Arc<Inner>, engine: &mut StreamEngine, code: Option<i32>) {
    // Fail every pending control correlation: dropping the senders wakes
    // the waiters with a recoverable error.
    let pending = std::mem::take(&mut *inner.pending.lock());
    if !pending.is_empty() {
        tracing::debug!(count = pending.len(), "failing pending control requests on exit");
    }
    drop(pending);

    let mut out = Vec::new();
    engine.flush_now(&mut out);
    emit_outputs(inner, out).await;

    inner.state.lock().queue.clear();
    inner.set_status(SessionStatus::Offline).await;
    inner.emit(ClientEvent::Exited { code }).await;
}
