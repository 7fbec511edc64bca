//! Shared runtime types for the AgentRelay binaries: configuration,
//! the common error type, and structured trace events.

pub mod config;
pub mod error;
pub mod trace;

pub use config::{ConfigIssue, ConfigSeverity, GatewayConfig, RunnerConfig};
pub use error::{Error, Result};
pub use trace::TraceEvent;
