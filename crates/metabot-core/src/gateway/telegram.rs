//! Telegram long-poll adapter.
//!
//! Each update is normalized and handed to the bridge in its own task so a
//! long-running agent invocation never blocks the dispatcher.

use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{Document, Message, PhotoSize};
use tracing::info;

use crate::bridge::{IncomingMessage, MessageBridge};

pub struct TelegramGateway {
    token: String,
    bridge: Arc<MessageBridge>,
}

impl TelegramGateway {
    pub fn new(token: &str, bridge: Arc<MessageBridge>) -> Self {
        Self { token: token.to_string(), bridge }
    }

    /// Run the dispatcher until the process shuts down.
    pub async fn run(self) -> Result<()> {
        let bot = Bot::new(&self.token);
        info!(bot = self.bridge.bot_name(), "Telegram gateway started");

        let bridge = self.bridge;
        let handler = Update::filter_message().endpoint(
            move |msg: Message, bridge: Arc<MessageBridge>| async move {
                if let Some(incoming) = normalize(&msg) {
                    // Authorization and per-chat serialization live in the
                    // bridge; the gateway only translates.
                    tokio::spawn(bridge.handle_message(incoming));
                }
                respond(())
            },
        );

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![bridge])
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

fn normalize(msg: &Message) -> Option<IncomingMessage> {
    let user_id = msg
        .from
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| "unknown".to_owned());
    let chat_type = if msg.chat.is_private() { "p2p" } else { "group" };

    let text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or_default()
        .to_owned();
    let image_key = msg
        .photo()
        .and_then(largest_photo)
        .map(|p| p.file.id.clone());
    let (file_key, file_name) = match msg.document() {
        Some(doc) => (Some(doc.file.id.clone()), document_name(doc)),
        None => (None, None),
    };

    if text.is_empty() && image_key.is_none() && file_key.is_none() {
        return None;
    }

    Some(IncomingMessage {
        message_id: msg.id.0.to_string(),
        chat_id: msg.chat.id.to_string(),
        chat_type: chat_type.to_owned(),
        user_id,
        text,
        image_key,
        file_key,
        file_name,
    })
}

fn largest_photo(photos: &[PhotoSize]) -> Option<&PhotoSize> {
    photos.iter().max_by_key(|p| p.width * p.height)
}

fn document_name(doc: &Document) -> Option<String> {
    doc.file_name.clone()
}
