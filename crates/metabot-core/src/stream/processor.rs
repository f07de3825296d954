//! Folds the agent event stream into an evolving [`CardState`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::card::{CardState, CardStatus, PendingQuestion, ToolCallEntry, ToolCallStatus};
use super::events::AgentEvent;
use crate::outputs::is_image_extension;

/// Cap on the tool-call detail shown on a card.
const DETAIL_MAX_LEN: usize = 120;

/// Folds [`AgentEvent`]s into a monotonically evolving card state.
///
/// Once the state is terminal every further fold is a no-op, so a replay of
/// a recorded trace always lands on the same final state.
pub struct StreamProcessor {
    state: CardState,
    session_id: Option<String>,
    image_paths: Vec<PathBuf>,
    /// Maps open tool_use ids to their index in `state.tool_calls`.
    open_tools: HashMap<String, usize>,
}

impl StreamProcessor {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            state: CardState::thinking(user_prompt),
            session_id: None,
            image_paths: Vec::new(),
            open_tools: HashMap::new(),
        }
    }

    /// Fold one event and return the updated state.
    pub fn process(&mut self, event: &AgentEvent) -> CardState {
        if self.state.is_terminal() {
            return self.state.clone();
        }

        match event {
            AgentEvent::SystemInit { session_id } => {
                self.session_id = Some(session_id.clone());
            }
            AgentEvent::TextDelta { text } => {
                self.state.response_text.push_str(text);
                self.mark_running();
            }
            AgentEvent::ToolUseStart { id, name, input } => {
                self.track_written_image(name, input);
                let index = self.state.tool_calls.len();
                self.state.tool_calls.push(ToolCallEntry {
                    name: name.clone(),
                    detail: tool_detail(name, input),
                    status: ToolCallStatus::Running,
                });
                if !id.is_empty() {
                    self.open_tools.insert(id.clone(), index);
                }
                self.mark_running();
            }
            AgentEvent::ToolUseDone { id, .. } => {
                if let Some(index) = self.open_tools.remove(id) {
                    if let Some(entry) = self.state.tool_calls.get_mut(index) {
                        entry.status = ToolCallStatus::Done;
                    }
                }
            }
            AgentEvent::AskUser { tool_use_id, questions } => {
                self.state.pending_question = Some(PendingQuestion {
                    tool_use_id: tool_use_id.clone(),
                    questions: questions.clone(),
                });
                self.state.status = CardStatus::WaitingForInput;
            }
            AgentEvent::Result { is_error, cost_usd, duration_ms, result } => {
                if let Some(text) = result {
                    if self.state.response_text.is_empty() {
                        self.state.response_text = text.clone();
                    }
                }
                self.state.cost_usd = *cost_usd;
                self.state.duration_ms = *duration_ms;
                self.state.status = if *is_error {
                    if self.state.error_message.is_none() {
                        self.state.error_message = result.clone();
                    }
                    CardStatus::Error
                } else {
                    CardStatus::Complete
                };
                self.close_open_tools();
            }
            AgentEvent::Error { message } => {
                self.state.error_message = Some(message.clone());
                self.state.status = CardStatus::Error;
                self.close_open_tools();
            }
        }

        self.state.clone()
    }

    pub fn state(&self) -> &CardState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Image paths observed as file-write tool targets during the run.
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    /// Drop the pending question after it has been answered so further
    /// stream events render a running card again.
    pub fn clear_pending_question(&mut self) {
        self.state.pending_question = None;
        if self.state.status == CardStatus::WaitingForInput {
            self.state.status = CardStatus::Running;
        }
    }

    fn mark_running(&mut self) {
        if self.state.status == CardStatus::Thinking {
            self.state.status = CardStatus::Running;
        }
    }

    fn close_open_tools(&mut self) {
        for (_, index) in self.open_tools.drain() {
            if let Some(entry) = self.state.tool_calls.get_mut(index) {
                entry.status = ToolCallStatus::Done;
            }
        }
    }

    fn track_written_image(&mut self, name: &str, input: &Value) {
        if name != "Write" {
            return;
        }
        let Some(path) = input.get("file_path").and_then(Value::as_str) else {
            return;
        };
        let path = PathBuf::from(path);
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if is_image_extension(&ext) && !self.image_paths.contains(&path) {
            self.image_paths.push(path);
        }
    }
}

/// A short human-readable summary of a tool invocation's input.
fn tool_detail(name: &str, input: &Value) -> String {
    let detail = match name {
        "Bash" => input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "Read" | "Write" | "Edit" => input
            .get("file_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "Glob" | "Grep" => input
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "WebFetch" => input
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => match input {
            Value::Null => String::new(),
            other => serde_json::to_string(other).unwrap_or_default(),
        },
    };

    truncate_chars(&detail, DETAIL_MAX_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Extract image paths referenced from markdown in the final response text.
/// Fallback path for images the agent mentioned but did not write into the
/// outputs directory.
pub fn extract_image_paths(text: &str) -> Vec<PathBuf> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\[[^\]]*\]\(([^()\s]+\.(?:png|jpe?g|gif|webp|bmp|svg|tiff?))\)")
            .expect("image path regex")
    });

    let mut paths = Vec::new();
    for cap in re.captures_iter(text) {
        let path = PathBuf::from(&cap[1]);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}
