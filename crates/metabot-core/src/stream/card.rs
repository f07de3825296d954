//! The observable projection of an in-flight task.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Thinking,
    Running,
    Complete,
    Error,
    WaitingForInput,
}

impl CardStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CardStatus::Complete | CardStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Done,
}

/// One observable agent step, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEntry {
    pub name: String,
    pub detail: String,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question: String,
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// An outstanding ask-user tool invocation awaiting a reply or auto-answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Vec<Question>,
}

/// The state a chat card renders. Monotonic per task: `response_text` only
/// grows, `tool_calls` is append-only, and a terminal status is final.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardState {
    pub status: CardStatus,
    pub user_prompt: String,
    pub response_text: String,
    pub tool_calls: Vec<ToolCallEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<PendingQuestion>,
}

impl CardState {
    pub fn thinking(user_prompt: impl Into<String>) -> Self {
        Self {
            status: CardStatus::Thinking,
            user_prompt: user_prompt.into(),
            response_text: String::new(),
            tool_calls: Vec::new(),
            cost_usd: None,
            duration_ms: None,
            error_message: None,
            pending_question: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
