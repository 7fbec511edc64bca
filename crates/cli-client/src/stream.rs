//! Assistant streaming state machine.
//!
//! Reassembles the per-turn stream events (`message_start` …
//! `message_stop`) into batched text/thinking deltas, completed tool-use
//! blocks, and paired tool results. Text is flushed on a short timer or on
//! an output-kind change, whichever comes first, so chat surfaces get a
//! steady trickle instead of one character per frame.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde_json::Value;
use similar::TextDiff;

use ar_protocol::envelope::OutputKind;

use crate::protocol::{AssistantContent, AssistantMessage, ContentBlock, ContentDelta, StreamEvent, Usage};

/// Batch window for text/thinking deltas.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Cap on the text of a forwarded tool result.
pub const MAX_TOOL_RESULT_CHARS: usize = 2_000;

/// What the engine emits while a turn streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    /// A batched chunk of assistant text or thinking.
    Delta { kind: OutputKind, text: String },
    /// A completed tool-use block with its parsed input.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    /// An Edit/MultiEdit tool call rendered as a unified diff.
    Edit {
        tool_use_id: String,
        tool_name: String,
        path: Option<String>,
        diff: String,
    },
    /// A tool result paired back to its tool-use block.
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        input: Value,
        content: String,
        is_error: bool,
    },
    /// Token usage from a `message_delta`.
    Tokens {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Human-readable activity label ("Thinking", "Running command", …).
    Activity {
        label: Option<String>,
        tool: Option<String>,
    },
    /// The turn stopped to use a tool; the session is waiting.
    Waiting,
    /// `message_stop` seen; buffers flushed.
    TurnDone,
}

#[derive(Debug, Clone)]
struct ToolBlock {
    id: String,
    name: String,
    input_json: String,
}

/// Per-session turn buffer. One engine per CLI client.
pub struct StreamEngine {
    text: String,
    kind: OutputKind,
    current_tool: Option<ToolBlock>,
    /// Completed tool blocks of this turn, for pairing later results.
    tools: HashMap<String, (String, Value)>,
    last_flush: Instant,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            kind: OutputKind::Stdout,
            current_tool: None,
            tools: HashMap::new(),
            last_flush: Instant::now(),
        }
    }

    /// Feed one stream event, appending any resulting outputs.
    pub fn on_event(&mut self, event: &StreamEvent, out: &mut Vec<StreamOutput>) {
        match event {
            StreamEvent::MessageStart { .. } => {
                self.text.clear();
                self.kind = OutputKind::Stdout;
                self.current_tool = None;
                self.tools.clear();
                out.push(StreamOutput::Activity {
                    label: Some("Thinking".into()),
                    tool: None,
                });
            }

            StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                ContentBlock::ToolUse { id, name, input } => {
                    // A tool block closes any open text/thinking buffer.
                    self.flush_buffer(out);
                    self.current_tool = Some(ToolBlock {
                        id: id.clone(),
                        name: name.clone(),
                        input_json: input
                            .as_ref()
                            .filter(|v| !v.is_null())
                            .map(|v| v.to_string())
                            .unwrap_or_default(),
                    });
                    out.push(StreamOutput::Activity {
                        label: Some(activity_label(name)),
                        tool: Some(name.clone()),
                    });
                }
                ContentBlock::Thinking { thinking } => {
                    self.flush_buffer(out);
                    self.kind = OutputKind::Thinking;
                    self.text.push_str(thinking);
                }
                ContentBlock::Text { text } => {
                    self.flush_buffer(out);
                    self.kind = OutputKind::Stdout;
                    self.text.push_str(text);
                }
                ContentBlock::Unknown => {}
            },

            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::TextDelta { text } => {
                    if self.kind != OutputKind::Stdout {
                        self.flush_buffer(out);
                        self.kind = OutputKind::Stdout;
                    }
                    self.text.push_str(text);
                }
                ContentDelta::ThinkingDelta { thinking } => {
                    if self.kind != OutputKind::Thinking {
                        self.flush_buffer(out);
                        self.kind = OutputKind::Thinking;
                    }
                    self.text.push_str(thinking);
                }
                ContentDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.current_tool.as_mut() {
                        tool.input_json.push_str(partial_json);
                    }
                }
                ContentDelta::SignatureDelta { .. } | ContentDelta::Unknown => {}
            },

            StreamEvent::ContentBlockStop { .. } => {
                if let Some(tool) = self.current_tool.take() {
                    self.finish_tool(tool, out);
                } else {
                    self.flush_buffer(out);
                }
            }

            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    out.push(tokens(usage));
                }
                if let Some(info) = delta {
                    if info.stop_reason.as_deref() == Some("tool_use") {
                        out.push(StreamOutput::Waiting);
                    }
                }
            }

            StreamEvent::MessageStop => {
                self.flush_buffer(out);
                out.push(StreamOutput::Activity {
                    label: None,
                    tool: None,
                });
                out.push(StreamOutput::TurnDone);
            }

            StreamEvent::Unknown => {}
        }
    }

    /// A completed (non-streamed) assistant turn, for sessions running
    /// without partial messages.
    pub fn on_assistant_turn(&mut self, message: &AssistantMessage, out: &mut Vec<StreamOutput>) {
        for content in &message.content {
            match content {
                AssistantContent::Text { text } => {
                    if !text.is_empty() {
                        out.push(StreamOutput::Delta {
                            kind: OutputKind::Stdout,
                            text: text.clone(),
                        });
                    }
                }
                AssistantContent::Thinking { thinking } => {
                    if !thinking.is_empty() {
                        out.push(StreamOutput::Delta {
                            kind: OutputKind::Thinking,
                            text: thinking.clone(),
                        });
                    }
                }
                AssistantContent::ToolUse { id, name, input } => {
                    let tool = ToolBlock {
                        id: id.clone(),
                        name: name.clone(),
                        input_json: input.to_string(),
                    };
                    self.finish_tool(tool, out);
                }
                AssistantContent::Unknown => {}
            }
        }
        if let Some(usage) = &message.usage {
            out.push(tokens(usage));
        }
    }

    /// Pair a tool result from a later `user` message against the tool
    /// blocks of this turn. Unknown ids are dropped (logged by the caller).
    pub fn on_tool_result(
        &mut self,
        tool_use_id: &str,
        content: &str,
        is_error: bool,
        out: &mut Vec<StreamOutput>,
    ) -> bool {
        let Some((name, input)) = self.tools.get(tool_use_id).cloned() else {
            return false;
        };
        let text = if name == "Read" {
            strip_line_numbers(content)
        } else {
            content.to_string()
        };
        out.push(StreamOutput::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            tool_name: name,
            input,
            content: truncate_chars(&text, MAX_TOOL_RESULT_CHARS),
            is_error,
        });
        true
    }

    /// Flush the text buffer if the batch window elapsed.
    pub fn flush_due(&mut self, out: &mut Vec<StreamOutput>) {
        if !self.text.is_empty() && self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush_buffer(out);
        }
    }

    /// Flush unconditionally (teardown paths).
    pub fn flush_now(&mut self, out: &mut Vec<StreamOutput>) {
        self.flush_buffer(out);
    }

    fn flush_buffer(&mut self, out: &mut Vec<StreamOutput>) {
        self.last_flush = Instant::now();
        if self.text.is_empty() {
            return;
        }
        out.push(StreamOutput::Delta {
            kind: self.kind,
            text: std::mem::take(&mut self.text),
        });
    }

    fn finish_tool(&mut self, tool: ToolBlock, out: &mut Vec<StreamOutput>) {
        // Best-effort parse; an unterminated stream leaves an empty input.
        let input: Value = serde_json::from_str(&tool.input_json)
            .unwrap_or_else(|_| Value::Object(Default::default()));
        self.tools
            .insert(tool.id.clone(), (tool.name.clone(), input.clone()));

        if tool.name == "Edit" || tool.name == "MultiEdit" {
            out.push(StreamOutput::Edit {
                tool_use_id: tool.id,
                path: input
                    .get("file_path")
                    .and_then(Value::as_str)
                    .map(String::from),
                diff: edit_diff(&tool.name, &input),
                tool_name: tool.name,
            });
        } else {
            out.push(StreamOutput::ToolUse {
                tool_use_id: tool.id,
                name: tool.name,
                input,
            });
        }
        self.kind = OutputKind::Stdout;
    }
}

fn tokens(usage: &Usage) -> StreamOutput {
    StreamOutput::Tokens {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    }
}

/// Human label for the activity line while a tool streams its input.
fn activity_label(tool_name: &str) -> String {
    match tool_name {
        "Bash" => "Running command".into(),
        "Read" => "Reading file".into(),
        "Write" => "Writing file".into(),
        "Edit" | "MultiEdit" => "Editing file".into(),
        "Grep" | "Glob" => "Searching".into(),
        "WebFetch" | "WebSearch" => "Browsing".into(),
        "Task" => "Delegating".into(),
        "AskUserQuestion" => "Asking a question".into(),
        other => format!("Using {other}"),
    }
}

/// Unified diff of an Edit/MultiEdit input. Accepts both the `old_string`
/// and the `oldText` key families.
fn edit_diff(tool_name: &str, input: &Value) -> String {
    fn one(old: &str, new: &str) -> String {
        TextDiff::from_lines(old, new)
            .unified_diff()
            .context_radius(3)
            .header("before", "after")
            .to_string()
    }

    fn strings(edit: &Value) -> (String, String) {
        let old = edit
            .get("old_string")
            .or_else(|| edit.get("oldText"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let new = edit
            .get("new_string")
            .or_else(|| edit.get("newText"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        (old.to_string(), new.to_string())
    }

    if tool_name == "MultiEdit" {
        let edits = input
            .get("edits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        edits
            .iter()
            .map(|edit| {
                let (old, new) = strings(edit);
                one(&old, &new)
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        let (old, new) = strings(input);
        one(&old, &new)
    }
}

/// Strip the `     1→` gutter the Read tool prefixes to each line.
fn strip_line_numbers(content: &str) -> String {
    static GUTTER: OnceLock<regex::Regex> = OnceLock::new();
    let re = GUTTER.get_or_init(|| regex::Regex::new(r"(?m)^\s*\d+→").unwrap());
    re.replace_all(content, "").into_owned()
}

/// Char-boundary-safe truncation with an ellipsis.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageDeltaInfo;

    fn text_delta(text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta { text: text.into() },
        }
    }

    fn thinking_delta(text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::ThinkingDelta {
                thinking: text.into(),
            },
        }
    }

    fn drive(engine: &mut StreamEngine, events: &[StreamEvent]) -> Vec<StreamOutput> {
        let mut out = Vec::new();
        for event in events {
            engine.on_event(event, &mut out);
        }
        out
    }

    fn collect_text(outputs: &[StreamOutput], kind: OutputKind) -> String {
        outputs
            .iter()
            .filter_map(|o| match o {
                StreamOutput::Delta { kind: k, text } if *k == kind => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn delta_concatenation_matches_full_text() {
        let mut engine = StreamEngine::new();
        let outputs = drive(
            &mut engine,
            &[
                StreamEvent::MessageStart { message: None },
                text_delta("Hello"),
                text_delta(", "),
                thinking_delta("hmm"),
                thinking_delta(" ok"),
                text_delta("world"),
                StreamEvent::MessageStop,
            ],
        );
        assert_eq!(collect_text(&outputs, OutputKind::Stdout), "Hello, world");
        assert_eq!(collect_text(&outputs, OutputKind::Thinking), "hmm ok");
        assert!(outputs.contains(&StreamOutput::TurnDone));
    }

    #[test]
    fn tool_block_closes_open_text_buffer_first() {
        let mut engine = StreamEngine::new();
        let outputs = drive(
            &mut engine,
            &[
                StreamEvent::MessageStart { message: None },
                text_delta("running a command"),
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ContentBlock::ToolUse {
                        id: "tu_1".into(),
                        name: "Bash".into(),
                        input: None,
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: r#"{"comm"#.into(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: r#"and":"ls"}"#.into(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 1 },
            ],
        );

        // Text completion must precede the tool-use record.
        let text_at = outputs
            .iter()
            .position(|o| matches!(o, StreamOutput::Delta { .. }))
            .unwrap();
        let tool_at = outputs
            .iter()
            .position(|o| matches!(o, StreamOutput::ToolUse { .. }))
            .unwrap();
        assert!(text_at < tool_at);

        match &outputs[tool_at] {
            StreamOutput::ToolUse {
                tool_use_id,
                name,
                input,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(name, "Bash");
                assert_eq!(input["command"], "ls");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn malformed_tool_input_falls_back_to_empty_object() {
        let mut engine = StreamEngine::new();
        let outputs = drive(
            &mut engine,
            &[
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::ToolUse {
                        id: "tu_1".into(),
                        name: "Bash".into(),
                        input: None,
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: r#"{"command": "tru"#.into(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 0 },
            ],
        );
        match &outputs[..] {
            [StreamOutput::Activity { .. }, StreamOutput::ToolUse { input, .. }] => {
                assert_eq!(input, &serde_json::json!({}));
            }
            other => panic!("unexpected outputs: {other:?}"),
        }
    }

    #[test]
    fn edit_produces_unified_diff() {
        let mut engine = StreamEngine::new();
        let input = serde_json::json!({
            "file_path": "/tmp/a.rs",
            "old_string": "fn main() {}\n",
            "new_string": "fn main() {\n    run();\n}\n",
        });
        let outputs = drive(
            &mut engine,
            &[
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::ToolUse {
                        id: "tu_e".into(),
                        name: "Edit".into(),
                        input: Some(input),
                    },
                },
                StreamEvent::ContentBlockStop { index: 0 },
            ],
        );
        let edit = outputs
            .iter()
            .find_map(|o| match o {
                StreamOutput::Edit { path, diff, .. } => Some((path.clone(), diff.clone())),
                _ => None,
            })
            .expect("edit output");
        assert_eq!(edit.0.as_deref(), Some("/tmp/a.rs"));
        assert!(edit.1.contains("-fn main() {}"));
        assert!(edit.1.contains("+    run();"));
    }

    #[test]
    fn stop_reason_tool_use_marks_waiting() {
        let mut engine = StreamEngine::new();
        let outputs = drive(
            &mut engine,
            &[StreamEvent::MessageDelta {
                delta: Some(MessageDeltaInfo {
                    stop_reason: Some("tool_use".into()),
                    stop_sequence: None,
                }),
                usage: Some(Usage {
                    input_tokens: Some(10),
                    output_tokens: Some(20),
                    ..Default::default()
                }),
            }],
        );
        assert!(outputs.contains(&StreamOutput::Waiting));
        assert!(outputs.contains(&StreamOutput::Tokens {
            input_tokens: Some(10),
            output_tokens: Some(20),
        }));
    }

    #[test]
    fn tool_results_pair_by_id_and_truncate() {
        let mut engine = StreamEngine::new();
        let mut out = Vec::new();
        engine.on_event(
            &StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "Bash".into(),
                    input: Some(serde_json::json!({"command": "yes"})),
                },
            },
            &mut out,
        );
        engine.on_event(&StreamEvent::ContentBlockStop { index: 0 }, &mut out);

        out.clear();
        let long = "y\n".repeat(5_000);
        assert!(engine.on_tool_result("tu_1", &long, false, &mut out));
        match &out[..] {
            [StreamOutput::ToolResult {
                tool_use_id,
                content,
                input,
                ..
            }] => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(input["command"], "yes");
                assert!(content.chars().count() <= MAX_TOOL_RESULT_CHARS);
                assert!(content.ends_with('…'));
            }
            other => panic!("unexpected outputs: {other:?}"),
        }

        // Unknown ids are reported unmatched.
        assert!(!engine.on_tool_result("tu_unknown", "x", false, &mut Vec::new()));
    }

    #[test]
    fn read_results_lose_their_line_number_gutter() {
        let mut engine = StreamEngine::new();
        let mut out = Vec::new();
        engine.on_event(
            &StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::ToolUse {
                    id: "tu_r".into(),
                    name: "Read".into(),
                    input: Some(serde_json::json!({"file_path": "/tmp/x"})),
                },
            },
            &mut out,
        );
        engine.on_event(&StreamEvent::ContentBlockStop { index: 0 }, &mut out);

        out.clear();
        engine.on_tool_result("tu_r", "     1→fn main() {}\n     2→", false, &mut out);
        match &out[..] {
            [StreamOutput::ToolResult { content, .. }] => {
                assert_eq!(content, "fn main() {}\n");
            }
            other => panic!("unexpected outputs: {other:?}"),
        }
    }

    #[test]
    fn deltas_batch_until_the_window_elapses() {
        let mut engine = StreamEngine::new();
        let mut out = Vec::new();
        engine.on_event(&StreamEvent::MessageStart { message: None }, &mut out);
        out.clear();

        engine.on_event(&text_delta("a"), &mut out);
        engine.on_event(&text_delta("b"), &mut out);
        engine.flush_due(&mut out);
        assert!(out.is_empty(), "flushed before the window: {out:?}");

        std::thread::sleep(FLUSH_INTERVAL + Duration::from_millis(50));
        engine.flush_due(&mut out);
        assert_eq!(collect_text(&out, OutputKind::Stdout), "ab");
    }

    #[test]
    fn message_start_resets_the_turn_buffer() {
        let mut engine = StreamEngine::new();
        let mut out = Vec::new();
        engine.on_event(&text_delta("left over"), &mut out);
        engine.on_event(&StreamEvent::MessageStart { message: None }, &mut out);
        engine.on_event(&StreamEvent::MessageStop, &mut out);
        assert_eq!(collect_text(&out, OutputKind::Stdout), "");
    }
}
