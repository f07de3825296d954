//! Per-chat conversation sessions.
//!
//! A session binds a chat to its working directory and to the external
//! agent's resumable session id. Sessions expire after 24 hours of
//! inactivity and are swept hourly. Resumable sessions (those that have a
//! session id) survive restarts through a per-bot JSON file; in-memory
//! state stays authoritative when the disk disagrees.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sessions idle longer than this are dropped.
pub const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Interval between expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One chat's conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub working_directory: PathBuf,
    /// Unix milliseconds of the last activity.
    pub last_used: i64,
}

/// Per-bot session store.
pub struct SessionManager {
    store_path: PathBuf,
    default_working_dir: PathBuf,
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl SessionManager {
    /// Load the store from `data_dir/sessions-<bot_name>.json`, dropping
    /// entries past their TTL.
    pub fn new(data_dir: &Path, bot_name: &str, default_working_dir: PathBuf) -> Self {
        let store_path = data_dir.join(format!("sessions-{bot_name}.json"));
        let sessions = load_store(&store_path);
        if !sessions.is_empty() {
            info!(bot = bot_name, count = sessions.len(), "Restored sessions");
        }
        Self {
            store_path,
            default_working_dir,
            sessions: Mutex::new(sessions),
        }
    }

    /// Return the session for `chat_id`, creating one with the default
    /// working directory if needed. Bumps `last_used`.
    pub fn get_session(&self, chat_id: &str) -> UserSession {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(chat_id.to_string()).or_insert_with(|| UserSession {
            session_id: None,
            working_directory: self.default_working_dir.clone(),
            last_used: now_ms(),
        });
        entry.last_used = now_ms();
        entry.clone()
    }

    /// Record the agent session id discovered in the event stream.
    pub fn set_session_id(&self, chat_id: &str, session_id: &str) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            let entry = sessions.entry(chat_id.to_string()).or_insert_with(|| UserSession {
                session_id: None,
                working_directory: self.default_working_dir.clone(),
                last_used: now_ms(),
            });
            entry.session_id = Some(session_id.to_string());
            entry.last_used = now_ms();
        }
        self.persist();
    }

    /// Forget the agent session id but keep the working directory.
    pub fn reset_session(&self, chat_id: &str) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(entry) = sessions.get_mut(chat_id) {
                entry.session_id = None;
                entry.last_used = now_ms();
            }
        }
        self.persist();
    }

    /// Drop sessions idle past the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = now_ms() - SESSION_TTL_MS;
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            let before = sessions.len();
            sessions.retain(|_, s| s.last_used >= cutoff);
            before - sessions.len()
        };
        if removed > 0 {
            debug!(removed, "Swept expired sessions");
            self.persist();
        }
        removed
    }

    /// Run the hourly sweep until cancelled.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    self.sweep_expired();
                }
            }
        }
    }

    /// Write resumable sessions to disk. IO failures are warnings; memory
    /// stays authoritative.
    fn persist(&self) {
        let resumable: HashMap<String, UserSession> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| s.session_id.is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let json = match serde_json::to_string_pretty(&resumable) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize sessions");
                return;
            }
        };

        if let Err(e) = write_atomic(&self.store_path, &json) {
            warn!(path = %self.store_path.display(), error = %e, "Failed to persist sessions");
        }
    }
}

fn load_store(path: &Path) -> HashMap<String, UserSession> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return HashMap::new(),
    };

    let mut sessions: HashMap<String, UserSession> = match serde_json::from_str(&content) {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse session store");
            return HashMap::new();
        }
    };

    let cutoff = now_ms() - SESSION_TTL_MS;
    sessions.retain(|_, s| s.last_used >= cutoff);
    sessions
}

/// Temp-file-plus-rename so a crash mid-write never corrupts the store.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
