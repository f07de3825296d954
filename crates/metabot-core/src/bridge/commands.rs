//! Slash command handling.
//!
//! Recognised commands are answered directly; anything else starting with
//! `/` falls through and is treated as an agent prompt.

use tracing::warn;

use super::{IncomingMessage, MessageBridge};
use crate::memory::format_folder_tree;
use crate::sender::NoticeColor;

const HELP_TEXT: &str = "\
/help — Show this help\n\
/reset — Start a fresh agent session (keeps the working directory)\n\
/stop — Stop the currently running task\n\
/status — Show session and task status\n\
/memory list | search <query> | status — Browse the memory store\n\n\
Any other message is handed to the agent. While a task is running, new \
messages are queued and run in order.";

impl MessageBridge {
    /// Handle a slash command. Returns `false` when the command is not
    /// recognised and the text should be treated as a prompt.
    pub(super) async fn handle_command(&self, msg: &IncomingMessage) -> bool {
        let trimmed = msg.text.trim();
        let (cmd, args) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));

        match cmd {
            "/help" | "/start" => {
                self.notice(&msg.chat_id, "Metabot Help", HELP_TEXT, NoticeColor::Blue)
                    .await;
                true
            }
            "/reset" => {
                self.sessions.reset_session(&msg.chat_id);
                self.notice(
                    &msg.chat_id,
                    "Session Reset",
                    "The next message starts a fresh agent session.",
                    NoticeColor::Green,
                )
                .await;
                true
            }
            "/stop" => {
                self.handle_stop(&msg.chat_id).await;
                true
            }
            "/status" => {
                self.handle_status(msg).await;
                true
            }
            "/memory" => {
                self.handle_memory(&msg.chat_id, args.trim()).await;
                true
            }
            _ => false,
        }
    }

    async fn handle_stop(&self, chat_id: &str) {
        let stopped = {
            let mut running = self.running.lock().unwrap();
            match running.get_mut(chat_id) {
                Some(task) => {
                    if let Some(timer) = task.question_timer.take() {
                        timer.cancel();
                    }
                    if let Some(control) = &task.control {
                        control.finish();
                    }
                    task.abort.cancel();
                    true
                }
                None => false,
            }
        };

        if stopped {
            self.notice(
                chat_id,
                "Task Stopped",
                "The running task is being aborted.",
                NoticeColor::Orange,
            )
            .await;
        } else {
            self.notice(
                chat_id,
                "No Running Task",
                "There is nothing to stop right now.",
                NoticeColor::Blue,
            )
            .await;
        }
    }

    async fn handle_status(&self, msg: &IncomingMessage) {
        let session = self.sessions.get_session(&msg.chat_id);
        let session_display = session
            .session_id
            .as_deref()
            .map(|sid| sid.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "None".into());
        let running = self.is_busy(&msg.chat_id);

        let content = format!(
            "👤 User: {}\n📂 Working directory: {}\n🔗 Session: {}\n⚙️ Running task: {}",
            msg.user_id,
            session.working_directory.display(),
            session_display,
            if running { "yes" } else { "no" },
        );
        self.notice(&msg.chat_id, "Status", &content, NoticeColor::Blue)
            .await;
    }

    async fn handle_memory(&self, chat_id: &str, args: &str) {
        let Some(memory) = &self.memory else {
            self.notice(
                chat_id,
                "Memory Unavailable",
                "No memory service is configured for this bot.",
                NoticeColor::Orange,
            )
            .await;
            return;
        };

        let (sub, rest) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
        let result = match sub {
            "" | "list" => memory.list().await.map(|docs| format_folder_tree(&docs)),
            "search" => {
                let query = rest.trim();
                if query.is_empty() {
                    self.notice(
                        chat_id,
                        "Memory Search",
                        "Usage: /memory search <query>",
                        NoticeColor::Blue,
                    )
                    .await;
                    return;
                }
                memory.search(query).await.map(|hits| {
                    if hits.is_empty() {
                        "No matches.".to_string()
                    } else {
                        hits.iter()
                            .map(|hit| match &hit.snippet {
                                Some(snippet) => format!("📄 {}\n   {}", hit.path, snippet),
                                None => format!("📄 {}", hit.path),
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    }
                })
            }
            "status" => memory.health().await.map(|health| {
                format!(
                    "Status: {}\nDocuments: {}",
                    health.status,
                    health
                        .documents
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "unknown".into())
                )
            }),
            other => {
                self.notice(
                    chat_id,
                    "Memory",
                    &format!("Unknown subcommand `{other}`. Use list, search or status."),
                    NoticeColor::Blue,
                )
                .await;
                return;
            }
        };

        match result {
            Ok(content) => {
                self.notice(chat_id, "Memory", &content, NoticeColor::Blue).await;
            }
            Err(e) => {
                warn!(error = %e, "Memory service call failed");
                self.notice(
                    chat_id,
                    "Memory Error",
                    "The memory service did not respond.",
                    NoticeColor::Red,
                )
                .await;
            }
        }
    }
}
