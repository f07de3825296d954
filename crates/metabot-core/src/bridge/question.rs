//! Question/answer payload construction.
//!
//! The agent's ask-user tool expects a JSON object mapping each question
//! header to the chosen answer. A numeric reply selects an option by its
//! 1-based position; anything else is passed through as free text.

use serde_json::{json, Map, Value};

use crate::stream::PendingQuestion;

/// Stock answer sent when the user never replies.
pub const TIMEOUT_ANSWER: &str =
    "No reply within 5 minutes. Please decide on your own and proceed.";

/// Stock answer for headless runs with no interactive user.
pub const AUTO_ANSWER: &str = "Please decide on your own and proceed.";

/// Build the answers payload for a user reply.
pub fn reply_payload(pending: &PendingQuestion, reply: &str) -> Value {
    let reply = reply.trim();
    let mut answers = Map::new();
    for question in &pending.questions {
        let text = match reply.parse::<usize>() {
            Ok(n) if n >= 1 && n <= question.options.len() => {
                question.options[n - 1].label.clone()
            }
            _ => reply.to_string(),
        };
        answers.insert(question.header.clone(), Value::String(text));
    }
    json!({ "answers": answers })
}

/// Payload dispatched when the question timer fires.
pub fn timeout_payload() -> Value {
    json!({ "answers": { "_timeout": TIMEOUT_ANSWER } })
}

/// Payload dispatched for api tasks, which have no user to ask.
pub fn auto_payload() -> Value {
    json!({ "answers": { "_auto": AUTO_ANSWER } })
}
