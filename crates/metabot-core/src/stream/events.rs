//! Tagged agent events and the wire adapter.
//!
//! The agent subprocess emits one JSON object per stdout line in its own
//! nested envelope format. [`AgentEvent::from_wire_line`] parses a raw line
//! once and flattens it; everything downstream works with typed variants
//! and never touches raw JSON again.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::card::{PendingQuestion, Question, QuestionOption};

/// Tool name the agent uses to ask the user a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// A single event from the agent stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Emitted once at startup; carries the resumable session id.
    SystemInit { session_id: String },
    /// A chunk of assistant text.
    TextDelta { text: String },
    /// A tool invocation has started.
    ToolUseStart {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// A previously started tool invocation finished.
    ToolUseDone {
        id: String,
        #[serde(default)]
        is_error: bool,
    },
    /// The agent wants the user to answer a question before continuing.
    AskUser {
        tool_use_id: String,
        questions: Vec<Question>,
    },
    /// Terminal result for the whole invocation.
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    /// Stream-level error.
    Error { message: String },
}

impl AgentEvent {
    /// Parse one raw stdout line into zero or more events.
    ///
    /// An assistant envelope can carry several content blocks (text plus
    /// tool uses), so this returns a `Vec`. Unknown or malformed lines map
    /// to an empty vec, not an error: the stream keeps flowing.
    pub fn from_wire_line(line: &str) -> Vec<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        match raw.get("type").and_then(Value::as_str) {
            Some("system") => {
                if raw.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(sid) = raw.get("session_id").and_then(Value::as_str) {
                        return vec![AgentEvent::SystemInit {
                            session_id: sid.to_string(),
                        }];
                    }
                }
                Vec::new()
            }
            Some("assistant") => flatten_assistant(&raw),
            Some("user") => flatten_tool_results(&raw),
            Some("result") => vec![AgentEvent::Result {
                is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
                duration_ms: raw.get("duration_ms").and_then(Value::as_u64),
                result: raw
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }],
            Some("error") => vec![AgentEvent::Error {
                message: raw
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error")
                    .to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

fn flatten_assistant(raw: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = raw
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(AgentEvent::TextDelta {
                            text: text.to_string(),
                        });
                    }
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);

                if name == ASK_USER_TOOL {
                    if let Some(pending) = parse_ask_user(&id, &input) {
                        events.push(AgentEvent::AskUser {
                            tool_use_id: pending.tool_use_id,
                            questions: pending.questions,
                        });
                        continue;
                    }
                }
                events.push(AgentEvent::ToolUseStart { id, name, input });
            }
            _ => {}
        }
    }
    events
}

fn flatten_tool_results(raw: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = raw
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|b| {
            b.get("tool_use_id").and_then(Value::as_str).map(|id| {
                AgentEvent::ToolUseDone {
                    id: id.to_string(),
                    is_error: b.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                }
            })
        })
        .collect()
}

fn parse_ask_user(tool_use_id: &str, input: &Value) -> Option<PendingQuestion> {
    let questions = input.get("questions")?.as_array()?;
    let parsed: Vec<Question> = questions
        .iter()
        .filter_map(|q| {
            Some(Question {
                question: q.get("question")?.as_str()?.to_string(),
                header: q
                    .get("header")
                    .and_then(Value::as_str)
                    .unwrap_or("Question")
                    .to_string(),
                options: q
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|opts| {
                        opts.iter()
                            .filter_map(|o| {
                                Some(QuestionOption {
                                    label: o.get("label")?.as_str()?.to_string(),
                                    description: o
                                        .get("description")
                                        .and_then(Value::as_str)
                                        .map(str::to_string),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                multi_select: q
                    .get("multiSelect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect();

    if parsed.is_empty() {
        return None;
    }
    Some(PendingQuestion {
        tool_use_id: tool_use_id.to_string(),
        questions: parsed,
    })
}
