//! Canonical structured-message schema for synced transcripts.
//!
//! Every vendor transcript is normalized into this shape before it crosses
//! the wire, so the gateway never sees vendor-specific records. Message ids
//! are deterministic (`"<turnId>:<itemId>:<blockIndex>"`) which makes
//! retransmission idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One normalized transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredMessage {
    pub id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub turn_id: String,
    pub item_id: String,
    pub content: Vec<Block>,
}

/// A tagged content block inside a structured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        name: String,
        input: Value,
        tool_use_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        is_error: bool,
        content: String,
    },
    Plan {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalNeeded {
        title: String,
        description: String,
        tool_name: String,
        status: String,
        requires_attach: bool,
        payload: Value,
    },
}

/// Deterministic message id: the same raw input always yields the same id.
pub fn block_id(turn_id: &str, item_id: &str, block_index: usize) -> String {
    format!("{turn_id}:{item_id}:{block_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_is_deterministic() {
        assert_eq!(block_id("t1", "i0", 2), "t1:i0:2");
        assert_eq!(block_id("t1", "i0", 2), block_id("t1", "i0", 2));
    }

    #[test]
    fn block_serde_tags() {
        let block = Block::ToolUse {
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
            tool_use_id: "tu_1".into(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["toolUseId"], "tu_1");

        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn approval_needed_wire_shape() {
        let block = Block::ApprovalNeeded {
            title: "Bash".into(),
            description: "ls".into(),
            tool_name: "Bash".into(),
            status: "pending".into(),
            requires_attach: true,
            payload: Value::Null,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "approval_needed");
        assert_eq!(json["requiresAttach"], true);
    }
}
