//! `ar-gateway` — the control-plane half of AgentRelay.
//!
//! The gateway multiplexes many runners to many users: it accepts runner
//! WebSocket registrations (with reclaim-on-reconnect), tracks sessions
//! and their status, owns the permission state store, and forwards
//! everything user-visible through the [`ChatSurface`](surface::ChatSurface)
//! seam. The chat rendering itself lives outside this crate.

pub mod actions;
pub mod dispatch;
pub mod permissions;
pub mod runners;
pub mod sessions;
pub mod state;
pub mod surface;
pub mod ws;

pub use permissions::{PermissionStatus, PermissionStore};
pub use runners::RunnerRegistry;
pub use state::AppState;
