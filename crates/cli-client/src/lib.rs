//! `ar-cli-client` — drives one interactive coding-agent CLI process.
//!
//! The runner creates one [`CliClient`] per session. The client owns the
//! child process (spawned with vendor-specific stream-JSON flags), decodes
//! its newline-delimited output, reassembles streamed assistant turns, and
//! correlates out-of-band control requests/responses by request id.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ runner session task                                       │
//! │                                                           │
//! │   let (tx, rx) = mpsc::channel(256);                      │
//! │   let client = CliClient::spawn(spec, config, tx).await?; │
//! │   client.send_message("list files").await?;               │
//! │   while let Some(event) = rx.recv().await { … }           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything leaves the client through its typed event channel; there is
//! no callback registry and no global state.

pub mod args;
pub mod client;
pub mod process;
pub mod protocol;
pub mod stream;

pub use args::{build_args, command_spec, resolve_binary};
pub use client::{ClientConfig, ClientEvent, CliClient, LocalControlHandler, PermissionEvent};
pub use process::{CliProcess, CommandSpec, ProcessError, ProcessEvent};
pub use stream::{StreamEngine, StreamOutput, FLUSH_INTERVAL, MAX_TOOL_RESULT_CHARS};
