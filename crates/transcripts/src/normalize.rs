//! Shared normalization helpers.
//!
//! Vendor mappers lean on these so every reader enforces the same
//! truncation limits, deterministic ids, and fallback behavior.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use ar_protocol::blocks::{block_id, Block, Role, StructuredMessage};

/// Cap on the text carried by a single block.
pub const MAX_BLOCK_CHARS: usize = 2_000;

/// Cap on a JSON summary rendered into a text block.
pub const MAX_JSON_SUMMARY_CHARS: usize = 1_000;

/// Raw messages this close to the transcript tail with an unresolved
/// tool use get an `approval_needed` block: the session is most likely
/// parked on a permission decision.
pub const APPROVAL_TAIL_WINDOW: usize = 3;

/// Char-boundary-safe truncation with an ellipsis.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Compact single-line JSON rendering, truncated for display.
pub fn json_summary(value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_text(&rendered, MAX_JSON_SUMMARY_CHARS)
}

/// Deterministic fallback timestamp for records that carry none.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Build a message around a list of blocks, deriving the deterministic id
/// from the first block's position.
pub fn message(
    role: Role,
    created_at: DateTime<Utc>,
    turn_id: &str,
    item_id: &str,
    content: Vec<Block>,
) -> StructuredMessage {
    StructuredMessage {
        id: block_id(turn_id, item_id, 0),
        role,
        created_at,
        turn_id: turn_id.to_string(),
        item_id: item_id.to_string(),
        content,
    }
}

/// The fallback for record types a reader does not understand: one text
/// block `"[<type>] <json-summary>"` instead of silently dropping data.
pub fn fallback_message(
    kind: &str,
    raw: &Value,
    created_at: DateTime<Utc>,
    turn_id: &str,
    item_id: &str,
) -> StructuredMessage {
    message(
        Role::User,
        created_at,
        turn_id,
        item_id,
        vec![Block::Text {
            text: format!("[{kind}] {}", json_summary(raw)),
        }],
    )
}

/// An `approval_needed` block for a tool use still waiting on a decision.
pub fn approval_needed_block(tool_name: &str, input: &Value) -> Block {
    Block::ApprovalNeeded {
        title: format!("{tool_name} approval required"),
        description: json_summary(input),
        tool_name: tool_name.to_string(),
        status: "pending".into(),
        requires_attach: true,
        payload: input.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(3_000);
        let out = truncate_text(&s, MAX_BLOCK_CHARS);
        assert_eq!(out.chars().count(), MAX_BLOCK_CHARS);
        assert!(out.ends_with('…'));

        assert_eq!(truncate_text("short", MAX_BLOCK_CHARS), "short");
    }

    #[test]
    fn json_summary_is_bounded() {
        let value = serde_json::json!({"blob": "x".repeat(5_000)});
        assert!(json_summary(&value).chars().count() <= MAX_JSON_SUMMARY_CHARS);
    }

    #[test]
    fn fallback_names_the_unknown_kind() {
        let msg = fallback_message(
            "mystery-record",
            &serde_json::json!({"a": 1}),
            epoch(),
            "t0",
            "i0",
        );
        assert_eq!(msg.id, "t0:i0:0");
        match &msg.content[..] {
            [Block::Text { text }] => assert!(text.starts_with("[mystery-record] ")),
            other => panic!("unexpected content: {other:?}"),
        }
    }
}
