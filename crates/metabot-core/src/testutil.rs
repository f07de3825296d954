//! Deterministic mocks for the two seams of the bridge: the agent runner
//! and the platform sender. Test-only.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeContext, MessageBridge};
use crate::config::{BotConfig, Platform};
use crate::cost::CostTracker;
use crate::executor::{
    AgentRunner, ExecutionControl, ExecutionHandle, ExecutionRequest, ExecutorError,
};
use crate::metrics::{AuditLog, Metrics};
use crate::outputs::OutputsManager;
use crate::sender::{NoticeColor, PlatformSender};
use crate::session::SessionManager;
use crate::stream::{AgentEvent, CardState};

// ── Mock runner ───────────────────────────────────────────────────────

/// One step of a scripted agent run.
pub enum ScriptStep {
    /// Emit an event on the stream.
    Emit(AgentEvent),
    /// Block until an answer arrives on the input channel; the parsed
    /// answers payload is recorded in [`MockRunner::answers`].
    AwaitAnswer,
    /// Sleep (virtual time in paused tests).
    Sleep(Duration),
    /// Block until the invocation is aborted, then end the stream.
    Hang,
}

/// Scripted [`AgentRunner`]. Each `start` consumes the next script; an
/// exhausted runner yields an immediately-ending stream.
#[derive(Default)]
pub struct MockRunner {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    pub requests: Mutex<Vec<ExecutionRequest>>,
    pub answers: Arc<Mutex<Vec<Value>>>,
}

impl MockRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, script: Vec<ScriptStep>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    /// A script that completes immediately with the given text.
    pub fn quick_script(text: &str) -> Vec<ScriptStep> {
        vec![
            ScriptStep::Emit(AgentEvent::SystemInit { session_id: "s-quick".into() }),
            ScriptStep::Emit(AgentEvent::TextDelta { text: text.into() }),
            ScriptStep::Emit(AgentEvent::Result {
                is_error: false,
                cost_usd: Some(0.001),
                duration_ms: Some(10),
                result: None,
            }),
        ]
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn start(&self, req: ExecutionRequest) -> Result<ExecutionHandle, ExecutorError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        self.requests.lock().unwrap().push(req.clone());

        let (event_tx, event_rx) = mpsc::channel(64);
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel::<String>();
        let finish = CancellationToken::new();
        let control = ExecutionControl::new(answer_tx, finish);
        let abort = req.abort.clone();
        let answers = self.answers.clone();

        tokio::spawn(async move {
            for step in script {
                match step {
                    ScriptStep::Emit(event) => {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::AwaitAnswer => {
                        tokio::select! {
                            _ = abort.cancelled() => return,
                            line = answer_rx.recv() => {
                                let Some(line) = line else { return };
                                if let Some(payload) = parse_answer_line(&line) {
                                    answers.lock().unwrap().push(payload);
                                }
                            }
                        }
                    }
                    ScriptStep::Sleep(d) => {
                        tokio::select! {
                            _ = abort.cancelled() => return,
                            _ = tokio::time::sleep(d) => {}
                        }
                    }
                    ScriptStep::Hang => {
                        abort.cancelled().await;
                        return;
                    }
                }
            }
        });

        Ok(ExecutionHandle { events: event_rx, control })
    }
}

/// Pull the answers JSON back out of the stream-json input line.
fn parse_answer_line(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line).ok()?;
    let text = value
        .pointer("/message/content/0/content/0/text")?
        .as_str()?;
    serde_json::from_str(text).ok()
}

// ── Mock sender ───────────────────────────────────────────────────────

/// Recording [`PlatformSender`] with fault injection for card updates.
#[derive(Default)]
pub struct MockSender {
    /// Every card state sent or updated, in order.
    pub cards: Mutex<Vec<CardState>>,
    /// (title, content, color) of every notice.
    pub notices: Mutex<Vec<(String, String, NoticeColor)>>,
    pub texts: Mutex<Vec<String>>,
    pub images: Mutex<Vec<PathBuf>>,
    pub files: Mutex<Vec<PathBuf>>,
    /// This many upcoming `update_card` calls fail.
    pub update_failures: AtomicUsize,
    next_card: AtomicUsize,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.update_failures.store(n, Ordering::SeqCst);
    }

    pub fn last_card(&self) -> Option<CardState> {
        self.cards.lock().unwrap().last().cloned()
    }

    pub fn notice_titles(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .map(|(title, _, _)| title.clone())
            .collect()
    }
}

#[async_trait]
impl PlatformSender for MockSender {
    async fn send_card(&self, _chat_id: &str, state: &CardState) -> anyhow::Result<Option<String>> {
        self.cards.lock().unwrap().push(state.clone());
        let n = self.next_card.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("card-{n}")))
    }

    async fn update_card(&self, _card_id: &str, state: &CardState) -> anyhow::Result<()> {
        let failures = self.update_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.update_failures.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("injected update failure");
        }
        self.cards.lock().unwrap().push(state.clone());
        Ok(())
    }

    async fn send_text_notice(
        &self,
        _chat_id: &str,
        title: &str,
        content: &str,
        color: NoticeColor,
    ) -> anyhow::Result<()> {
        self.notices
            .lock()
            .unwrap()
            .push((title.to_string(), content.to_string(), color));
        Ok(())
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_image_file(&self, _chat_id: &str, path: &Path) -> bool {
        self.images.lock().unwrap().push(path.to_path_buf());
        true
    }

    async fn send_local_file(&self, _chat_id: &str, path: &Path, _name: &str) -> bool {
        self.files.lock().unwrap().push(path.to_path_buf());
        true
    }

    async fn download_image(&self, _message_id: &str, _key: &str, save_path: &Path) -> bool {
        tokio::fs::write(save_path, b"fake-image").await.is_ok()
    }

    async fn download_file(&self, _message_id: &str, _key: &str, save_path: &Path) -> bool {
        tokio::fs::write(save_path, b"fake-file").await.is_ok()
    }
}

// ── Bridge assembly ───────────────────────────────────────────────────

pub fn test_bot_config(name: &str, working_dir: &Path) -> BotConfig {
    BotConfig {
        name: name.into(),
        platform: Platform::Telegram,
        app_id: None,
        app_secret: None,
        bot_token: Some("test-token".into()),
        default_working_directory: working_dir.to_path_buf(),
        authorized_user_ids: vec![],
        authorized_chat_ids: vec![],
        allowed_tools: vec![],
        max_turns: None,
        max_budget_usd: None,
        model: None,
    }
}

/// A bridge wired to mocks, with every collaborator reachable.
pub struct TestHarness {
    pub bridge: Arc<MessageBridge>,
    pub runner: Arc<MockRunner>,
    pub sender: Arc<MockSender>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditLog>,
    pub costs: Arc<CostTracker>,
}

/// Build a bridge wired to fresh mocks, rooted in `dir`.
pub fn harness(dir: &Path) -> TestHarness {
    let runner = MockRunner::new();
    let sender = MockSender::new();
    let sessions = Arc::new(SessionManager::new(dir, "testbot", dir.join("work")));
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLog::new());
    let costs = Arc::new(CostTracker::new());

    let bridge = MessageBridge::new(BridgeContext {
        bot_name: "testbot".into(),
        config: test_bot_config("testbot", &dir.join("work")),
        sender: sender.clone(),
        runner: runner.clone(),
        sessions: sessions.clone(),
        outputs: OutputsManager::new(dir.join("outputs")),
        downloads_dir: dir.join("downloads"),
        memory: None,
        metrics: metrics.clone(),
        audit: audit.clone(),
        costs: costs.clone(),
        api_port: None,
        api_secret: None,
    });

    TestHarness { bridge, runner, sender, sessions, metrics, audit, costs }
}

/// Poll `cond` until it holds, advancing virtual time in small steps
/// (up to ~250 s of virtual time in paused tests).
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
