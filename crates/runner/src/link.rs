//! The runner's single WebSocket to the gateway.
//!
//! Connection lifecycle: connect → send `register` → wait for
//! `registered` (or a fatal `error`, which makes the whole runner exit) →
//! full-duplex envelope loop with a 30 s heartbeat. On any disconnect the
//! link reconnects after a fixed 5 s delay; the peer set is small enough
//! that exponential backoff buys nothing.
//!
//! Sends while disconnected fail fast with `false` — callers decide
//! whether to retry or surface the loss. Nothing is buffered across
//! reconnects except the heartbeat state itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use ar_domain::TraceEvent;
use ar_protocol::envelope::{HeartbeatData, RegisterData};
use ar_protocol::{decode_line, encode_line, Decoded, Envelope};
use ar_protocol::CliKind;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long to wait for `registered` after sending `register`.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The gateway rejected us (bad token, name collision). Fatal: the
    /// runner process exits rather than hammering the gateway.
    #[error("gateway rejected registration: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub ws_url: String,
    pub token: String,
    pub runner_name: String,
    pub cli_kinds: Vec<CliKind>,
    pub default_workspace: Option<String>,
    pub heartbeat_interval: Duration,
}

/// Cheap handle other components use to push envelopes gateway-ward.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
}

impl LinkHandle {
    /// Fail-fast send: `false` while disconnected (or when the outbound
    /// queue is saturated). Never blocks.
    pub fn send(&self, envelope: Envelope) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "outbound envelope dropped");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Create the handle plus the run future. The future completes only on a
/// fatal registration error or shutdown.
pub fn channel(config: LinkConfig) -> (LinkHandle, LinkRunner) {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = LinkHandle {
        outbound: outbound_tx,
        connected: connected.clone(),
    };
    (
        handle,
        LinkRunner {
            config,
            outbound_rx,
            connected,
        },
    )
}

pub struct LinkRunner {
    config: LinkConfig,
    outbound_rx: mpsc::Receiver<Envelope>,
    connected: Arc<AtomicBool>,
}

enum ConnectionEnd {
    Closed,
    Shutdown,
}

impl LinkRunner {
    /// Run the reconnect loop, forwarding inbound envelopes to `inbound`.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<(), LinkError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_once(&inbound, &shutdown).await {
                Ok(ConnectionEnd::Shutdown) => return Ok(()),
                Ok(ConnectionEnd::Closed) => {
                    tracing::info!("gateway connection closed");
                }
                Err(LinkRunError::Fatal(message)) => {
                    return Err(LinkError::Fatal(message));
                }
                Err(LinkRunError::Transient(e)) => {
                    tracing::warn!(error = %e, "gateway connection lost");
                }
            }
            self.connected.store(false, Ordering::SeqCst);

            tracing::info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn connect_once(
        &mut self,
        inbound: &mpsc::Sender<Envelope>,
        shutdown: &CancellationToken,
    ) -> Result<ConnectionEnd, LinkRunError> {
        tracing::info!(url = %self.config.ws_url, "connecting to gateway");
        let (ws, _response) = tokio_tungstenite::connect_async(&self.config.ws_url)
            .await
            .map_err(|e| LinkRunError::Transient(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // ── Register ─────────────────────────────────────────────────
        let register = Envelope::Register(RegisterData {
            runner_name: self.config.runner_name.clone(),
            token: self.config.token.clone(),
            cli_kinds: self.config.cli_kinds.clone(),
            default_workspace: self.config.default_workspace.clone(),
        });
        send_envelope(&mut sink, &register)
            .await
            .map_err(LinkRunError::Transient)?;

        // ── Wait for registered / error ──────────────────────────────
        let registered = tokio::time::timeout(REGISTER_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                let Ok(Message::Text(text)) = message else {
                    continue;
                };
                match decode_line(&text) {
                    Decoded::Envelope(envelope) => match *envelope {
                        Envelope::Registered(data) => return Ok(data),
                        Envelope::Error(data) => return Err(LinkRunError::Fatal(data.message)),
                        other => {
                            tracing::debug!(kind = other.kind(), "pre-registration envelope, ignoring");
                        }
                    },
                    _ => continue,
                }
            }
            Err(LinkRunError::Transient("closed before registered".into()))
        })
        .await
        .map_err(|_| LinkRunError::Transient("registered timeout".into()))??;

        let runner_id = registered.runner_id.clone();
        self.connected.store(true, Ordering::SeqCst);
        TraceEvent::RunnerRegistered {
            runner_id: runner_id.clone(),
            reclaimed: registered.reclaimed,
        }
        .emit();
        tracing::info!(
            runner_id = %runner_id,
            reclaimed = registered.reclaimed,
            "registered with gateway"
        );
        let _ = inbound.send(Envelope::Registered(registered)).await;

        // ── Full-duplex envelope loop with heartbeat ─────────────────
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset(); // don't heartbeat immediately after register

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match decode_line(&text) {
                        Decoded::Envelope(envelope) => match *envelope {
                            Envelope::Error(data) => {
                                return Err(LinkRunError::Fatal(data.message));
                            }
                            envelope => {
                                if inbound.send(envelope).await.is_err() {
                                    return Ok(ConnectionEnd::Shutdown);
                                }
                            }
                        },
                        // Unknown/garbage frames are logged by the codec
                        // and dropped here, never fatal.
                        Decoded::Unknown { .. } | Decoded::Skip => {}
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(ConnectionEnd::Closed),
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => return Err(LinkRunError::Transient(e.to_string())),
                },

                maybe = self.outbound_rx.recv() => match maybe {
                    Some(envelope) => {
                        send_envelope(&mut sink, &envelope)
                            .await
                            .map_err(LinkRunError::Transient)?;
                    }
                    None => return Ok(ConnectionEnd::Shutdown),
                },

                _ = heartbeat.tick() => {
                    let beat = Envelope::Heartbeat(HeartbeatData {
                        runner_id: runner_id.clone(),
                        cli_kinds: self.config.cli_kinds.clone(),
                        timestamp: Utc::now(),
                    });
                    send_envelope(&mut sink, &beat)
                        .await
                        .map_err(LinkRunError::Transient)?;
                }

                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
            }
        }
    }
}

#[derive(Debug)]
enum LinkRunError {
    Fatal(String),
    Transient(String),
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let line = encode_line(envelope).map_err(|e| e.to_string())?;
    sink.send(Message::Text(line)).await.map_err(|e| e.to_string())
}

#[cfg(test)]
impl LinkHandle {
    /// A connected handle whose sends land in the returned receiver.
    pub(crate) fn test_pair() -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(256);
        (
            Self {
                outbound,
                connected: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_fast_while_disconnected() {
        let (handle, _runner) = channel(LinkConfig {
            ws_url: "ws://127.0.0.1:1/ws".into(),
            token: "t".into(),
            runner_name: "r".into(),
            cli_kinds: vec![CliKind::Claude],
            default_workspace: None,
            heartbeat_interval: Duration::from_secs(30),
        });
        assert!(!handle.is_connected());
        assert!(!handle.send(Envelope::SyncProjects(Default::default())));
    }
}
