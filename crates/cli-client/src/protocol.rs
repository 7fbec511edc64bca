//! The CLI's stream-JSON stdio protocol.
//!
//! Stdin carries `user`, `control_request`, and `control_response` objects;
//! stdout carries the full message set below, one JSON object per line.
//! Unknown message and block types decode to `Unknown` so newer CLIs don't
//! break older runners.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliMessage {
    System(SystemMessage),
    StreamEvent(StreamEventMessage),
    Assistant(AssistantEnvelope),
    User(UserEnvelope),
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponseEnvelope),
    Result(TurnResult),
    KeepAlive,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventMessage {
    pub event: StreamEvent,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming events (per assistant turn)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<Value>,
    },
    ContentBlockStart {
        #[serde(default)]
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Option<MessageDeltaInfo>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    SignatureDelta {
        #[serde(default)]
        signature: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageDeltaInfo {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completed assistant / user messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantEnvelope {
    pub message: AssistantMessage,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<AssistantContent>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEnvelope {
    pub message: UserPayload,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolResultContent {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl UserPayload {
    /// Extract `tool_result` blocks when the content is a block array.
    pub fn tool_results(&self) -> Vec<ToolResultContent> {
        let Some(items) = self.content.as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_result"))
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }
}

/// Render a tool-result content value (string or block array) as plain text.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestBody {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        permission_suggestions: Option<Vec<Value>>,
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        blocked_path: Option<String>,
        #[serde(default)]
        decision_reason: Option<String>,
    },
    HookCallback {
        #[serde(default)]
        callback_id: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },
    McpMessage {
        #[serde(default)]
        server_name: Option<String>,
        #[serde(default)]
        message: Option<Value>,
    },
    SetPermissionMode {
        mode: String,
    },
    SetModel {
        #[serde(default)]
        model: Option<String>,
    },
    SetMaxThinkingTokens {
        #[serde(default)]
        max_thinking_tokens: Option<u32>,
    },
    Initialize {
        #[serde(default)]
        hooks: Option<Value>,
    },
    Interrupt,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponseEnvelope {
    pub response: ControlResponseBody,
}

/// The one wire shape for control responses: nested under `response`, with
/// the correlation id inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseBody {
    Success {
        request_id: String,
        #[serde(default)]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        error: String,
    },
}

impl ControlResponseBody {
    pub fn request_id(&self) -> &str {
        match self {
            ControlResponseBody::Success { request_id, .. } => request_id,
            ControlResponseBody::Error { request_id, .. } => request_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdin line builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One text turn from the user.
pub fn user_message_line(text: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": text}],
        },
    }))
}

/// An outbound control request (interrupt, mode/model changes, …).
pub fn control_request_line(
    request_id: &str,
    body: &ControlRequestBody,
) -> Result<String, serde_json::Error> {
    let mut value = serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
    });
    value["request"] = serde_json::to_value(body)?;
    serde_json::to_string(&value)
}

/// An outbound control response, always in the nested shape.
pub fn control_response_line(body: &ControlResponseBody) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({
        "type": "control_response",
        "response": serde_json::to_value(body)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_system_message() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet-4","tools":["Bash","Read"],"apiKeySource":"env"}"#;
        match serde_json::from_str::<CliMessage>(line).unwrap() {
            CliMessage::System(msg) => {
                assert_eq!(msg.subtype, "init");
                assert_eq!(msg.session_id.as_deref(), Some("abc"));
                assert_eq!(msg.tools, vec!["Bash", "Read"]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_can_use_tool_control_request() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"permission_suggestions":[{"mode":"acceptEdits"}]}}"#;
        match serde_json::from_str::<CliMessage>(line).unwrap() {
            CliMessage::ControlRequest(req) => {
                assert_eq!(req.request_id, "r1");
                match req.request {
                    ControlRequestBody::CanUseTool {
                        tool_name, input, ..
                    } => {
                        assert_eq!(tool_name, "Bash");
                        assert_eq!(input["command"], "ls");
                    }
                    other => panic!("wrong body: {other:?}"),
                }
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_do_not_error() {
        let line = r#"{"type":"diagnostic_v9","payload":{}}"#;
        assert_eq!(
            serde_json::from_str::<CliMessage>(line).unwrap(),
            CliMessage::Unknown
        );
    }

    #[test]
    fn unknown_control_subtype_is_tolerated() {
        let line = r#"{"type":"control_request","request_id":"r9","request":{"subtype":"rotate_credentials"}}"#;
        match serde_json::from_str::<CliMessage>(line).unwrap() {
            CliMessage::ControlRequest(req) => {
                assert_eq!(req.request, ControlRequestBody::Unknown);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn control_response_is_nested() {
        let body = ControlResponseBody::Success {
            request_id: "r1".into(),
            response: Some(serde_json::json!({"behavior": "allow"})),
        };
        let line = control_response_line(&body).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["response"]["subtype"], "success");
        assert_eq!(value["response"]["request_id"], "r1");
        assert_eq!(value["response"]["response"]["behavior"], "allow");
    }

    #[test]
    fn user_payload_extracts_tool_results() {
        let payload: UserEnvelope = serde_json::from_str(
            r#"{"message":{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"tu_1","content":"file.txt"},
                {"type":"text","text":"noise"}
            ]}}"#,
        )
        .unwrap();
        let results = payload.message.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "tu_1");
        assert!(!results[0].is_error);
    }

    #[test]
    fn tool_result_text_handles_block_arrays() {
        let value = serde_json::json!([{"type":"text","text":"a"},{"type":"text","text":"b"}]);
        assert_eq!(tool_result_text(&value), "a\nb");
        assert_eq!(tool_result_text(&Value::String("plain".into())), "plain");
    }

    #[test]
    fn user_message_line_shape() {
        let line = user_message_line("hello").unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "hello");
    }
}
