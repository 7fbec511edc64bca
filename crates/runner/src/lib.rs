//! `ar-runner` — the host-side half of AgentRelay.
//!
//! A runner owns local CLI processes (one per session), keeps a single
//! reconnecting WebSocket to the gateway, bridges tool-permission control
//! requests to remote decisions, and watches on-disk transcript stores so
//! sessions started outside the fabric still sync.

pub mod dispatch;
pub mod doctor;
pub mod health;
pub mod link;
pub mod permissions;
pub mod registry;
pub mod session;
pub mod sync;

pub use dispatch::RunnerCtx;
pub use link::{LinkConfig, LinkError, LinkHandle};
pub use permissions::PermissionBroker;
pub use registry::SessionRegistry;
