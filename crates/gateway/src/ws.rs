//! WebSocket endpoint for runner connections.
//!
//! Flow:
//! 1. Runner connects to `/ws` and immediately sends `register`.
//! 2. The gateway validates the token (constant-time), derives the
//!    runner id, and replies `registered {runnerId, reclaimed}` — or a
//!    fatal `error`, on which the runner exits.
//! 3. Full-duplex envelope loop until the socket closes; the runner is
//!    then marked offline (never removed, so reclaim keeps working).

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use ar_domain::TraceEvent;
use ar_protocol::envelope::{ErrorData, RegisterData, RegisteredData};
use ar_protocol::{decode_line, encode_line, Decoded, Envelope};

use crate::dispatch;
use crate::state::AppState;

/// How long a fresh connection gets to send `register`.
const REGISTER_WINDOW: Duration = Duration::from_secs(10);

/// Constant-time token comparison via SHA-256 digests (hashing
/// normalizes lengths so `ct_eq` always compares 32 bytes).
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// GET /ws — upgrade and hand off to the socket handler.
pub async fn runner_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // ── 1. Wait for register ─────────────────────────────────────────
    let register = match wait_for_register(&mut stream).await {
        Some(register) => register,
        None => {
            tracing::warn!("connection closed before register");
            return;
        }
    };

    // ── 2. Validate the token ────────────────────────────────────────
    let authorized_users = match authenticate(&state, &register) {
        Ok(users) => users,
        Err(reason) => {
            tracing::warn!(runner_name = %register.runner_name, reason, "rejecting runner");
            let rejection = Envelope::Error(ErrorData {
                message: format!("registration rejected: {reason}"),
            });
            let _ = send_envelope(&mut sink, &rejection).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    // ── 3. Register (reclaiming any previous incarnation) ────────────
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(256);
    let (runner_id, reclaimed) = state
        .runners
        .register(&register, authorized_users, outbound_tx);
    TraceEvent::RunnerRegistered {
        runner_id: runner_id.clone(),
        reclaimed,
    }
    .emit();

    if send_envelope(
        &mut sink,
        &Envelope::Registered(RegisteredData {
            runner_id: runner_id.clone(),
            reclaimed,
        }),
    )
    .await
    .is_err()
    {
        state.runners.mark_offline(&runner_id);
        return;
    }

    // ── 4. Writer task ───────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if send_envelope(&mut sink, &envelope).await.is_err() {
                break;
            }
        }
    });

    // ── 5. Reader loop ───────────────────────────────────────────────
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_line(&text) {
                Decoded::Envelope(envelope) => {
                    dispatch::handle_envelope(&state, &runner_id, *envelope).await;
                }
                // Logged by the codec; the connection survives.
                Decoded::Unknown { .. } | Decoded::Skip => {}
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // ws-level ping/pong handled by axum
        }
    }

    // ── 6. Cleanup: mark offline, cascade to sessions ────────────────
    writer.abort();
    state.runners.mark_offline(&runner_id);
    let orphaned = state.sessions.mark_runner_offline(&runner_id);
    TraceEvent::RunnerOffline {
        runner_id: runner_id.clone(),
        missed_heartbeats: false,
    }
    .emit();
    tracing::info!(runner_id = %runner_id, orphaned, "runner disconnected");
}

async fn wait_for_register(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<RegisterData> {
    tokio::time::timeout(REGISTER_WINDOW, async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                if let Decoded::Envelope(envelope) = decode_line(&text) {
                    match *envelope {
                        Envelope::Register(data) => return Some(data),
                        other => {
                            tracing::debug!(kind = other.kind(), "expected register, got something else");
                        }
                    }
                }
            }
        }
        None
    })
    .await
    .unwrap_or(None)
}

/// Validate the register token. With no configured runners the gateway
/// runs open (dev mode) and grants access to everyone.
fn authenticate(state: &AppState, register: &RegisterData) -> Result<Vec<String>, &'static str> {
    if register.token.is_empty() {
        return Err("empty token");
    }
    if state.config.runners.is_empty() {
        return Ok(Vec::new());
    }
    state
        .config
        .runners
        .iter()
        .find(|auth| token_eq(&auth.token, &register.token))
        .map(|auth| auth.authorized_users.clone())
        .ok_or("invalid token")
}

async fn send_envelope(
    sink: &mut (impl SinkExt<Message> + Unpin),
    envelope: &Envelope,
) -> Result<(), ()> {
    let line = encode_line(envelope).map_err(|_| ())?;
    sink.send(Message::Text(line)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ar_domain::config::{GatewayConfig, RunnerAuth};
    use ar_protocol::CliKind;

    use crate::surface::LoggingSurface;

    fn register(token: &str) -> RegisterData {
        RegisterData {
            runner_name: "dev".into(),
            token: token.into(),
            cli_kinds: vec![CliKind::Claude],
            default_workspace: None,
        }
    }

    fn state_with_tokens(runners: Vec<RunnerAuth>) -> AppState {
        AppState::new(
            Arc::new(GatewayConfig {
                runners,
                ..Default::default()
            }),
            Arc::new(LoggingSurface),
        )
    }

    #[test]
    fn token_eq_matches_only_equal_tokens() {
        assert!(token_eq("secret", "secret"));
        assert!(!token_eq("secret", "Secret"));
        assert!(!token_eq("secret", "secret2"));
    }

    #[test]
    fn open_gateway_accepts_any_nonempty_token() {
        let state = state_with_tokens(vec![]);
        assert!(authenticate(&state, &register("anything")).is_ok());
        assert!(authenticate(&state, &register("")).is_err());
    }

    #[test]
    fn configured_gateway_requires_a_known_token() {
        let state = state_with_tokens(vec![RunnerAuth {
            name: "dev".into(),
            token: "0123456789abcdef".into(),
            authorized_users: vec!["alice".into()],
        }]);
        let users = authenticate(&state, &register("0123456789abcdef")).unwrap();
        assert_eq!(users, vec!["alice"]);
        assert!(authenticate(&state, &register("wrong")).is_err());
    }
}
