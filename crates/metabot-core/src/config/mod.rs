//! Configuration.
//!
//! Two JSON files: `~/.metabot/config.json` (app-level settings) and an
//! optional bots file (array of per-bot entries, §6.2 layout). Both use
//! camelCase keys because the file format predates this implementation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Chat platform a bot is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Feishu,
    Telegram,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Feishu => write!(f, "feishu"),
            Platform::Telegram => write!(f, "telegram"),
        }
    }
}

/// Per-bot static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub name: String,
    pub platform: Platform,

    // Feishu credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,

    // Telegram credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    pub default_working_directory: PathBuf,

    /// Empty means everyone is allowed.
    #[serde(default)]
    pub authorized_user_ids: Vec<String>,
    #[serde(default)]
    pub authorized_chat_ids: Vec<String>,

    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BotConfig {
    /// Whether a user/chat pair passes this bot's access lists.
    pub fn is_authorized(&self, user_id: &str, chat_id: &str) -> bool {
        let user_ok = self.authorized_user_ids.is_empty()
            || self.authorized_user_ids.iter().any(|u| u == user_id);
        let chat_ok = self.authorized_chat_ids.is_empty()
            || self.authorized_chat_ids.iter().any(|c| c == chat_id);
        user_ok && chat_ok
    }
}

/// App-level configuration from `~/.metabot/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub api_port: Option<u16>,
    pub api_secret: Option<String>,
    pub data_dir: PathBuf,
    /// Path of the bots file; `None` disables bot CRUD over the API.
    pub bots_file: Option<PathBuf>,
    pub default_timezone: String,
    pub memory_base_url: Option<String>,
    pub agent_binary: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_port: Some(8700),
            api_secret: None,
            data_dir: Self::default_dir(),
            bots_file: None,
            default_timezone: "Asia/Shanghai".into(),
            memory_base_url: None,
            agent_binary: "claude".into(),
        }
    }
}

impl AppConfig {
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".metabot")
    }

    pub fn default_path() -> PathBuf {
        Self::default_dir().join("config.json")
    }

    /// Load from the default path; missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write a starter config template; returns its path.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let template = serde_json::json!({
            "apiPort": 8700,
            "defaultTimezone": "Asia/Shanghai",
            "botsFile": Self::default_dir().join("bots.json"),
        });
        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }

    pub fn scheduled_tasks_path(&self) -> PathBuf {
        self.data_dir.join("scheduled-tasks.json")
    }

    pub fn outputs_base_dir(&self, bot_name: &str) -> PathBuf {
        self.data_dir.join("outputs").join(bot_name)
    }

    pub fn downloads_dir(&self, bot_name: &str) -> PathBuf {
        self.data_dir.join("downloads").join(bot_name)
    }
}

/// Load the bots file: a JSON array of bot entries.
pub fn load_bots_file(path: &Path) -> anyhow::Result<Vec<BotConfig>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Rewrite the bots file atomically.
pub fn save_bots_file(path: &Path, bots: &[BotConfig]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(bots)?;
    crate::session::write_atomic(path, &json)?;
    Ok(())
}
