//! Telegram sender.
//!
//! Cards are plain messages edited in place. Telegram rejects edits that
//! do not change the text with "message is not modified"; that response
//! is treated as success so coalesced updates never surface as errors.

use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId};
use tracing::{debug, warn};

use super::render::{render_card_text, render_notice_text};
use super::{NoticeColor, PlatformSender};
use crate::stream::CardState;

/// Maximum Telegram message length.
const TELEGRAM_MAX_LEN: usize = 4096;

pub struct TelegramSender {
    bot: Bot,
}

impl TelegramSender {
    pub fn new(token: &str) -> Self {
        Self { bot: Bot::new(token) }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn parse_chat(chat_id: &str) -> anyhow::Result<ChatId> {
        chat_id
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| anyhow!("invalid telegram chat id: {chat_id}"))
    }

    /// Card ids are `<chat_id>:<message_id>` since edits need both.
    fn parse_card_id(card_id: &str) -> anyhow::Result<(ChatId, MessageId)> {
        let (chat, msg) = card_id
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid card id: {card_id}"))?;
        Ok((Self::parse_chat(chat)?, MessageId(msg.parse::<i32>()?)))
    }
}

/// Split a message into chunks of at most `max_len` characters, preferring
/// newline boundaries.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_len {
            chunks.push(remaining.to_owned());
            break;
        }

        let byte_cap = remaining
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let slice = &remaining[..byte_cap];
        let break_at = match slice.rfind('\n') {
            Some(0) | None => byte_cap,
            Some(n) => n,
        };

        chunks.push(remaining[..break_at].to_owned());
        remaining = remaining[break_at..].trim_start_matches('\n');
    }

    chunks
}

fn is_not_modified(err: &teloxide::RequestError) -> bool {
    err.to_string().contains("message is not modified")
}

#[async_trait]
impl PlatformSender for TelegramSender {
    async fn send_card(&self, chat_id: &str, state: &CardState) -> anyhow::Result<Option<String>> {
        let chat = Self::parse_chat(chat_id)?;
        let text = render_card_text(state);
        let sent = self
            .bot
            .send_message(chat, truncate_for_card(&text))
            .await
            .context("telegram send_message failed")?;
        Ok(Some(format!("{}:{}", chat_id, sent.id.0)))
    }

    async fn update_card(&self, card_id: &str, state: &CardState) -> anyhow::Result<()> {
        let (chat, msg_id) = Self::parse_card_id(card_id)?;
        let text = render_card_text(state);
        match self.bot.edit_message_text(chat, msg_id, truncate_for_card(&text)).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(card_id, "Card text unchanged, edit skipped");
                Ok(())
            }
            Err(e) => Err(anyhow!("telegram edit failed: {e}")),
        }
    }

    async fn send_text_notice(
        &self,
        chat_id: &str,
        title: &str,
        content: &str,
        color: NoticeColor,
    ) -> anyhow::Result<()> {
        self.send_text(chat_id, &render_notice_text(title, content, color.emoji()))
            .await
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let chat = Self::parse_chat(chat_id)?;
        for chunk in chunk_message(text, TELEGRAM_MAX_LEN) {
            self.bot
                .send_message(chat, chunk)
                .await
                .context("telegram send_message failed")?;
        }
        Ok(())
    }

    async fn send_image_file(&self, chat_id: &str, path: &Path) -> bool {
        let Ok(chat) = Self::parse_chat(chat_id) else { return false };
        match self.bot.send_photo(chat, InputFile::file(path)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Telegram photo upload failed");
                false
            }
        }
    }

    async fn send_local_file(&self, chat_id: &str, path: &Path, name: &str) -> bool {
        let Ok(chat) = Self::parse_chat(chat_id) else { return false };
        let file = InputFile::file(path).file_name(name.to_owned());
        match self.bot.send_document(chat, file).await {
            Ok(_) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Telegram file upload failed");
                false
            }
        }
    }

    async fn download_image(&self, message_id: &str, key: &str, save_path: &Path) -> bool {
        self.download_file(message_id, key, save_path).await
    }

    async fn download_file(&self, _message_id: &str, key: &str, save_path: &Path) -> bool {
        let file = match self.bot.get_file(key).await {
            Ok(file) => file,
            Err(e) => {
                warn!(key, error = %e, "Telegram get_file failed");
                return false;
            }
        };

        let mut dst = match tokio::fs::File::create(save_path).await {
            Ok(dst) => dst,
            Err(e) => {
                warn!(path = %save_path.display(), error = %e, "Failed to create download target");
                return false;
            }
        };

        match self.bot.download_file(&file.path, &mut dst).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Telegram download failed");
                false
            }
        }
    }
}

fn truncate_for_card(text: &str) -> String {
    if text.chars().count() <= TELEGRAM_MAX_LEN {
        return text.to_string();
    }
    let mut out: String = text.chars().take(TELEGRAM_MAX_LEN - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_short_message() {
        assert_eq!(chunk_message("hello", 4096), vec!["hello"]);
    }

    #[test]
    fn chunk_long_message() {
        let long = "a".repeat(5000);
        let chunks = chunk_message(&long, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn chunk_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(100), "b".repeat(100));
        let chunks = chunk_message(&text, 150);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(100));
        assert_eq!(chunks[1], "b".repeat(100));
    }

    #[test]
    fn card_id_round_trip() {
        let (chat, msg) = TelegramSender::parse_card_id("12345:678").unwrap();
        assert_eq!(chat, ChatId(12345));
        assert_eq!(msg, MessageId(678));
        assert!(TelegramSender::parse_card_id("no-colon").is_err());
    }
}
