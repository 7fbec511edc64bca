//! Transcript discovery and normalization.
//!
//! Each CLI vendor persists conversations differently: Claude Code keeps
//! JSONL session files under an escaped-path project store, Codex exposes
//! an opaque thread API through its own CLI, Gemini keeps chat files under
//! the project root. The readers in this crate translate all three into
//! the canonical [`StructuredMessage`](ar_protocol::StructuredMessage)
//! schema so everything downstream is vendor-agnostic.
//!
//! Reading is strictly non-destructive: these modules never write into a
//! vendor store.

pub mod claude;
pub mod codex;
pub mod escape;
pub mod gemini;
pub mod normalize;

use chrono::{DateTime, Utc};

use ar_protocol::CliKind;

/// One discovered session, before hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: CliKind,
    pub project_path: String,
    pub updated_at: DateTime<Utc>,
}
