//! Platform senders: CardState → platform-native messages plus file IO.
//!
//! The bridge only ever talks to the [`PlatformSender`] trait; the Feishu
//! and Telegram implementations live behind it. Uploads and downloads are
//! best-effort booleans; a failed attachment never fails the task.

pub mod feishu;
mod render;
#[cfg(feature = "telegram")]
pub mod telegram;

use std::path::Path;

use async_trait::async_trait;

use crate::stream::CardState;

pub use render::{render_card_text, render_notice_text};

/// Theme of a short notice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeColor {
    Green,
    Blue,
    Orange,
    Red,
    Grey,
}

impl NoticeColor {
    /// Feishu card template name.
    pub fn template(self) -> &'static str {
        match self {
            NoticeColor::Green => "green",
            NoticeColor::Blue => "blue",
            NoticeColor::Orange => "orange",
            NoticeColor::Red => "red",
            NoticeColor::Grey => "grey",
        }
    }

    /// Emoji stand-in for platforms without colored cards.
    pub fn emoji(self) -> &'static str {
        match self {
            NoticeColor::Green => "✅",
            NoticeColor::Blue => "ℹ️",
            NoticeColor::Orange => "⚠️",
            NoticeColor::Red => "❌",
            NoticeColor::Grey => "▫️",
        }
    }
}

/// Renders card state into platform messages and moves files both ways.
#[async_trait]
pub trait PlatformSender: Send + Sync {
    /// Create a new card; returns an identifier usable with `update_card`.
    async fn send_card(&self, chat_id: &str, state: &CardState) -> anyhow::Result<Option<String>>;

    /// Update a previously sent card in place. Implementations tolerate
    /// "not modified" responses from the platform.
    async fn update_card(&self, card_id: &str, state: &CardState) -> anyhow::Result<()>;

    /// Themed notice with a title line.
    async fn send_text_notice(
        &self,
        chat_id: &str,
        title: &str,
        content: &str,
        color: NoticeColor,
    ) -> anyhow::Result<()>;

    /// Plain text.
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;

    /// Upload an image into the chat. Best effort.
    async fn send_image_file(&self, chat_id: &str, path: &Path) -> bool;

    /// Upload an arbitrary file into the chat. Best effort.
    async fn send_local_file(&self, chat_id: &str, path: &Path, name: &str) -> bool;

    /// Download a user-sent image attachment to `save_path`. Best effort.
    async fn download_image(&self, message_id: &str, key: &str, save_path: &Path) -> bool;

    /// Download a user-sent file attachment to `save_path`. Best effort.
    async fn download_file(&self, message_id: &str, key: &str, save_path: &Path) -> bool;
}
