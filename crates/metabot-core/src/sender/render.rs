//! Text rendering of card state, shared by both platform senders.

use crate::stream::{CardState, CardStatus, ToolCallStatus};

/// Longest response body shown on a card before truncation.
const RESPONSE_MAX_LEN: usize = 3000;

/// Render a card as plain markdown-ish text.
///
/// ```text
/// ⚙️ Working…
/// 💬 draw me a chart
/// ├ ✓ Read src/main.rs
/// └ ⏳ Bash cargo test
///
/// <response so far>
/// 💰 $0.0123 · ⏱ 12.3s
/// ```
pub fn render_card_text(state: &CardState) -> String {
    let mut out = String::new();

    out.push_str(status_line(state));
    out.push('\n');
    if !state.user_prompt.is_empty() {
        out.push_str(&format!("💬 {}\n", state.user_prompt));
    }

    if !state.tool_calls.is_empty() {
        let last = state.tool_calls.len() - 1;
        for (i, call) in state.tool_calls.iter().enumerate() {
            let connector = if i == last { "└" } else { "├" };
            let mark = match call.status {
                ToolCallStatus::Running => "⏳",
                ToolCallStatus::Done => "✓",
            };
            if call.detail.is_empty() {
                out.push_str(&format!("{connector} {mark} {}\n", call.name));
            } else {
                out.push_str(&format!("{connector} {mark} {} {}\n", call.name, call.detail));
            }
        }
    }

    if !state.response_text.is_empty() {
        out.push('\n');
        out.push_str(&truncate(&state.response_text, RESPONSE_MAX_LEN));
        out.push('\n');
    }

    if let Some(err) = &state.error_message {
        out.push_str(&format!("\n❌ {err}\n"));
    }

    if let Some(question) = &state.pending_question {
        for q in &question.questions {
            out.push_str(&format!("\n❓ {}\n", q.question));
            for (i, opt) in q.options.iter().enumerate() {
                match &opt.description {
                    Some(desc) => out.push_str(&format!("  {}. {} — {desc}\n", i + 1, opt.label)),
                    None => out.push_str(&format!("  {}. {}\n", i + 1, opt.label)),
                }
            }
        }
        out.push_str("\nReply with a number or free text.\n");
    }

    if let Some(footer) = footer_line(state) {
        out.push_str(&footer);
        out.push('\n');
    }

    out.trim_end().to_string()
}

/// Render a themed notice for platforms without colored cards.
pub fn render_notice_text(title: &str, content: &str, emoji: &str) -> String {
    if content.is_empty() {
        format!("{emoji} {title}")
    } else {
        format!("{emoji} {title}\n{content}")
    }
}

fn status_line(state: &CardState) -> &'static str {
    match state.status {
        CardStatus::Thinking => "🤔 Thinking…",
        CardStatus::Running => "⚙️ Working…",
        CardStatus::Complete => "✅ Done",
        CardStatus::Error => "❌ Error",
        CardStatus::WaitingForInput => "❓ Waiting for your input",
    }
}

fn footer_line(state: &CardState) -> Option<String> {
    if !state.is_terminal() {
        return None;
    }
    let mut parts = Vec::new();
    if let Some(cost) = state.cost_usd {
        parts.push(format!("💰 ${cost:.4}"));
    }
    if let Some(ms) = state.duration_ms {
        parts.push(format!("⏱ {:.1}s", ms as f64 / 1000.0));
    }
    if parts.is_empty() {
        None
    } else {
        Some(format!("\n{}", parts.join(" · ")))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{PendingQuestion, Question, QuestionOption, ToolCallEntry};

    #[test]
    fn renders_tool_tree_and_footer() {
        let mut state = CardState::thinking("hello");
        state.status = CardStatus::Complete;
        state.response_text = "world".into();
        state.tool_calls = vec![
            ToolCallEntry {
                name: "Read".into(),
                detail: "src/main.rs".into(),
                status: ToolCallStatus::Done,
            },
            ToolCallEntry {
                name: "Bash".into(),
                detail: "cargo test".into(),
                status: ToolCallStatus::Running,
            },
        ];
        state.cost_usd = Some(0.0123);
        state.duration_ms = Some(12_300);

        let text = render_card_text(&state);
        assert!(text.starts_with("✅ Done"));
        assert!(text.contains("├ ✓ Read src/main.rs"));
        assert!(text.contains("└ ⏳ Bash cargo test"));
        assert!(text.contains("world"));
        assert!(text.contains("$0.0123"));
        assert!(text.contains("12.3s"));
    }

    #[test]
    fn renders_question_options_numbered() {
        let mut state = CardState::thinking("deploy");
        state.status = CardStatus::WaitingForInput;
        state.pending_question = Some(PendingQuestion {
            tool_use_id: "q1".into(),
            questions: vec![Question {
                question: "Which env?".into(),
                header: "Env".into(),
                options: vec![
                    QuestionOption { label: "dev".into(), description: None },
                    QuestionOption {
                        label: "prod".into(),
                        description: Some("careful".into()),
                    },
                ],
                multi_select: false,
            }],
        });

        let text = render_card_text(&state);
        assert!(text.contains("❓ Which env?"));
        assert!(text.contains("1. dev"));
        assert!(text.contains("2. prod — careful"));
    }

    #[test]
    fn no_footer_while_running() {
        let mut state = CardState::thinking("hello");
        state.status = CardStatus::Running;
        state.cost_usd = Some(0.5);
        let text = render_card_text(&state);
        assert!(!text.contains("💰"));
    }
}
