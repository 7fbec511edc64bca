//! Runner ↔ gateway wire protocol.
//!
//! Runners are remote hosts that own interactive coding-agent CLI processes
//! and connect to the gateway over a single WebSocket. Every frame is one
//! newline-delimited JSON envelope with a `type` discriminant and a `data`
//! payload. The discriminant set is closed; anything else is logged and
//! dropped, never fatal.

pub mod blocks;
pub mod envelope;
pub mod identity;
pub mod session;

pub use blocks::{block_id, Block, Role, StructuredMessage};
pub use envelope::{decode_line, encode_line, Decoded, Envelope};
pub use identity::runner_id;
pub use session::{CliKind, PluginVariant, SessionOptions, SessionStatus};

/// Default cap on a single `sync_sessions_response` frame (2 MiB).
/// The sync service splits larger replies across multiple frames.
pub const MAX_SYNC_CHUNK_BYTES: usize = 2 * 1024 * 1024;
