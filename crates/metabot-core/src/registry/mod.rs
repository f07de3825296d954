//! Process-wide bot registry.
//!
//! Binds a bot name to its config, bridge, and sender. The API server and
//! the scheduler resolve bots through this map; nothing else holds
//! long-lived references.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::bridge::MessageBridge;
use crate::config::{BotConfig, Platform};
use crate::sender::PlatformSender;

/// One registered bot.
#[derive(Clone)]
pub struct RegisteredBot {
    pub name: String,
    pub platform: Platform,
    pub config: BotConfig,
    pub bridge: Arc<MessageBridge>,
    pub sender: Arc<dyn PlatformSender>,
}

/// Secret-free projection used by list endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSummary {
    pub name: String,
    pub platform: Platform,
    pub working_directory: String,
    pub allowed_tools: Vec<String>,
}

impl From<&RegisteredBot> for BotSummary {
    fn from(bot: &RegisteredBot) -> Self {
        Self {
            name: bot.name.clone(),
            platform: bot.platform,
            working_directory: bot
                .config
                .default_working_directory
                .to_string_lossy()
                .into_owned(),
            allowed_tools: bot.config.allowed_tools.clone(),
        }
    }
}

#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<HashMap<String, RegisteredBot>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bot: RegisteredBot) {
        self.bots.write().unwrap().insert(bot.name.clone(), bot);
    }

    pub fn get(&self, name: &str) -> Option<RegisteredBot> {
        self.bots.read().unwrap().get(name).cloned()
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.bots.write().unwrap().remove(name).is_some()
    }

    pub fn list(&self) -> Vec<BotSummary> {
        let mut summaries: Vec<BotSummary> = self
            .bots
            .read()
            .unwrap()
            .values()
            .map(BotSummary::from)
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn len(&self) -> usize {
        self.bots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.read().unwrap().is_empty()
    }

    /// All registered bots, for shutdown fan-out.
    pub fn all(&self) -> Vec<RegisteredBot> {
        self.bots.read().unwrap().values().cloned().collect()
    }
}
