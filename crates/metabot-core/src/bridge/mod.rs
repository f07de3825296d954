//! Per-chat task orchestration.
//!
//! The bridge is the single entry point for inbound chat messages. It
//! routes commands, feeds answers to pending questions, serialises agent
//! invocations per chat (queueing overflow), drives each invocation's
//! event stream into card updates, and owns the lifecycle timers.
//!
//! ## Concurrency model
//!
//! One running task per chat, enforced by claiming the `running` map slot
//! under its lock before any slow work starts. Different chats run
//! concurrently. The two shared maps (`running`, `queues`) are only held
//! for field access, never across an await.

mod commands;
mod outfiles;
mod question;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::cost::CostTracker;
use crate::executor::{AgentRunner, ApiContext, ExecPolicy, ExecutionControl, ExecutionRequest};
use crate::memory::MemoryClient;
use crate::metrics::{AuditLog, Metrics, COST_BUCKETS, DURATION_BUCKETS};
use crate::outputs::OutputsManager;
use crate::sender::{NoticeColor, PlatformSender};
use crate::session::SessionManager;
use crate::stream::{CardState, CardStatus, PendingQuestion, StreamProcessor};
use crate::throttle::RateLimiter;

/// Most messages a chat can queue behind a running task.
pub const MAX_QUEUE_SIZE: usize = 5;

/// Hard ceiling on one task's wall-clock time.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// A task with no stream activity for this long is aborted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How long a pending question waits for a reply before auto-answering.
pub const QUESTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Final-card delivery attempts and the backoff before each retry.
const FINAL_CARD_ATTEMPTS: u32 = 3;
const FINAL_CARD_BACKOFF: &[Duration] = &[
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Plain-text fallback truncation.
const FALLBACK_TEXT_MAX: usize = 2048;

/// A normalized inbound chat message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: String,
    pub chat_id: String,
    pub chat_type: String,
    pub user_id: String,
    pub text: String,
    pub image_key: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
}

impl IncomingMessage {
    pub fn text(chat_id: &str, user_id: &str, text: &str) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            chat_type: "p2p".into(),
            user_id: user_id.into(),
            text: text.into(),
            image_key: None,
            file_key: None,
            file_name: None,
        }
    }
}

/// Options for a headless invocation (scheduler / control API).
#[derive(Debug, Clone)]
pub struct ApiTaskOptions {
    pub prompt: String,
    pub chat_id: String,
    pub user_id: String,
    pub send_cards: bool,
}

/// Result of a headless invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTaskResult {
    pub success: bool,
    pub response_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum TaskMode {
    Interactive,
    Api { send_cards: bool },
}

impl TaskMode {
    fn shows_cards(self) -> bool {
        match self {
            TaskMode::Interactive => true,
            TaskMode::Api { send_cards } => send_cards,
        }
    }
}

/// In-memory record of the one task a chat may have running.
struct RunningTask {
    abort: CancellationToken,
    control: Option<ExecutionControl>,
    card_message_id: Option<String>,
    pending_question: Option<PendingQuestion>,
    question_timer: Option<CancellationToken>,
    session_id: Option<String>,
}

impl RunningTask {
    fn claimed() -> Self {
        Self {
            abort: CancellationToken::new(),
            control: None,
            card_message_id: None,
            pending_question: None,
            question_timer: None,
            session_id: None,
        }
    }
}

/// Everything a bridge needs at construction time.
pub struct BridgeContext {
    pub bot_name: String,
    pub config: BotConfig,
    pub sender: Arc<dyn PlatformSender>,
    pub runner: Arc<dyn AgentRunner>,
    pub sessions: Arc<SessionManager>,
    pub outputs: OutputsManager,
    pub downloads_dir: PathBuf,
    pub memory: Option<MemoryClient>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditLog>,
    pub costs: Arc<CostTracker>,
    pub api_port: Option<u16>,
    pub api_secret: Option<String>,
}

/// Per-chat orchestrator for one bot.
pub struct MessageBridge {
    bot_name: String,
    config: BotConfig,
    sender: Arc<dyn PlatformSender>,
    runner: Arc<dyn AgentRunner>,
    sessions: Arc<SessionManager>,
    outputs: OutputsManager,
    downloads_dir: PathBuf,
    memory: Option<MemoryClient>,
    metrics: Arc<Metrics>,
    audit: Arc<AuditLog>,
    costs: Arc<CostTracker>,
    api_port: Option<u16>,
    api_secret: Option<String>,
    running: Mutex<HashMap<String, RunningTask>>,
    queues: Mutex<HashMap<String, VecDeque<IncomingMessage>>>,
    cancel: CancellationToken,
}

enum Route {
    RejectImageAnswer,
    Answer {
        pending: PendingQuestion,
        control: Option<ExecutionControl>,
        session_id: Option<String>,
        timer: Option<CancellationToken>,
    },
    Queue,
    Execute,
}

impl MessageBridge {
    pub fn new(ctx: BridgeContext) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let bridge = Arc::new(Self {
            bot_name: ctx.bot_name,
            config: ctx.config,
            sender: ctx.sender,
            runner: ctx.runner,
            sessions: ctx.sessions,
            outputs: ctx.outputs,
            downloads_dir: ctx.downloads_dir,
            memory: ctx.memory,
            metrics: ctx.metrics,
            audit: ctx.audit,
            costs: ctx.costs,
            api_port: ctx.api_port,
            api_secret: ctx.api_secret,
            running: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            cancel,
        });

        let sessions = bridge.sessions.clone();
        let sweep_cancel = bridge.cancel.child_token();
        tokio::spawn(async move {
            sessions.run_sweeper(sweep_cancel).await;
        });

        bridge
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn is_busy(&self, chat_id: &str) -> bool {
        self.running.lock().unwrap().contains_key(chat_id)
    }

    /// Abort all running tasks and stop background work. Run loops exit at
    /// their next event boundary.
    pub fn destroy(&self) {
        self.cancel.cancel();
        let mut running = self.running.lock().unwrap();
        for task in running.values_mut() {
            if let Some(timer) = task.question_timer.take() {
                timer.cancel();
            }
            if let Some(control) = &task.control {
                control.finish();
            }
            task.abort.cancel();
        }
        self.queues.lock().unwrap().clear();
    }

    /// Single entry point for inbound messages.
    pub async fn handle_message(self: Arc<Self>, msg: IncomingMessage) {
        if !self.config.is_authorized(&msg.user_id, &msg.chat_id) {
            warn!(
                bot = self.bot_name,
                user_id = msg.user_id,
                chat_id = msg.chat_id,
                "Unauthorized message ignored"
            );
            return;
        }

        if msg.text.trim().starts_with('/') && self.handle_command(&msg).await {
            return;
        }

        let route = {
            let mut running = self.running.lock().unwrap();
            match running.get_mut(&msg.chat_id) {
                Some(task) if task.pending_question.is_some() => {
                    if msg.image_key.is_some() {
                        Route::RejectImageAnswer
                    } else {
                        Route::Answer {
                            pending: task.pending_question.take().expect("checked above"),
                            control: task.control.clone(),
                            session_id: task.session_id.clone(),
                            timer: task.question_timer.take(),
                        }
                    }
                }
                Some(_) => Route::Queue,
                None => {
                    running.insert(msg.chat_id.clone(), RunningTask::claimed());
                    Route::Execute
                }
            }
        };

        match route {
            Route::RejectImageAnswer => {
                let _ = self
                    .sender
                    .send_text(&msg.chat_id, "Please reply with text to answer the question.")
                    .await;
            }
            Route::Answer { pending, control, session_id, timer } => {
                if let Some(timer) = timer {
                    timer.cancel();
                }
                let payload = question::reply_payload(&pending, &msg.text);
                debug!(chat_id = msg.chat_id, "Routing reply to pending question");
                if let Some(control) = control {
                    control.send_answer(&pending.tool_use_id, session_id.as_deref(), payload);
                }
            }
            Route::Queue => self.enqueue(msg).await,
            Route::Execute => self.execute_query(msg).await,
        }
    }

    /// Headless variant used by the scheduler and the control API.
    pub async fn execute_api_task(self: Arc<Self>, opts: ApiTaskOptions) -> ApiTaskResult {
        {
            let mut running = self.running.lock().unwrap();
            if running.contains_key(&opts.chat_id) {
                return ApiTaskResult {
                    success: false,
                    response_text: String::new(),
                    session_id: None,
                    cost_usd: None,
                    duration_ms: None,
                    error: Some("chat is busy with another task".into()),
                };
            }
            running.insert(opts.chat_id.clone(), RunningTask::claimed());
        }

        let outcome = self
            .clone()
            .run_task(
                opts.chat_id.clone(),
                opts.user_id.clone(),
                opts.prompt.clone(),
                opts.prompt.clone(),
                TaskMode::Api { send_cards: opts.send_cards },
            )
            .await;

        let success = outcome.final_state.status == CardStatus::Complete;
        ApiTaskResult {
            success,
            response_text: outcome.final_state.response_text.clone(),
            session_id: outcome.session_id,
            cost_usd: outcome.final_state.cost_usd,
            duration_ms: outcome.final_state.duration_ms.or(Some(outcome.duration_ms)),
            error: if success {
                None
            } else {
                outcome.final_state.error_message.clone()
            },
        }
    }

    // ── Queueing ──────────────────────────────────────────────────────

    async fn enqueue(&self, msg: IncomingMessage) {
        let chat_id = msg.chat_id.clone();
        let position = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(chat_id.clone()).or_default();
            if queue.len() >= MAX_QUEUE_SIZE {
                None
            } else {
                queue.push_back(msg);
                Some(queue.len())
            }
        };

        match position {
            Some(n) => {
                self.notice(
                    &chat_id,
                    "Message Queued",
                    &format!("Queued position #{n}. It will run after the current task."),
                    NoticeColor::Blue,
                )
                .await;
            }
            None => {
                self.notice(
                    &chat_id,
                    "Queue Full",
                    &format!(
                        "The queue already holds {MAX_QUEUE_SIZE} messages. \
                         Use /stop to abort the current task."
                    ),
                    NoticeColor::Orange,
                )
                .await;
            }
        }
    }

    // ── Interactive execution ─────────────────────────────────────────

    async fn execute_query(self: Arc<Self>, msg: IncomingMessage) {
        let (prompt, display_prompt, downloaded) = self.build_prompt(&msg).await;
        self.clone()
            .run_task(
                msg.chat_id.clone(),
                msg.user_id.clone(),
                prompt,
                display_prompt,
                TaskMode::Interactive,
            )
            .await;

        if let Some(path) = downloaded {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "Download cleanup failed");
            }
        }
    }

    /// Annotate the prompt with any downloaded attachment.
    async fn build_prompt(&self, msg: &IncomingMessage) -> (String, String, Option<PathBuf>) {
        if msg.image_key.is_none() && msg.file_key.is_none() {
            return (msg.text.clone(), msg.text.clone(), None);
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.downloads_dir).await {
            warn!(error = %e, "Failed to create downloads dir");
        }

        if let Some(key) = &msg.image_key {
            let save_path = self
                .downloads_dir
                .join(format!("{}-image.png", msg.message_id));
            let display = format!("{} 🖼", msg.text).trim().to_string();
            if self.sender.download_image(&msg.message_id, key, &save_path).await {
                let prompt = format!(
                    "[The user attached an image saved at {}. Read it before answering.]\n\n{}",
                    save_path.display(),
                    msg.text
                );
                return (prompt, display, Some(save_path));
            }
            let prompt = format!(
                "[The user attached an image but it could not be downloaded.]\n\n{}",
                msg.text
            );
            return (prompt, display, None);
        }

        let key = msg.file_key.as_deref().expect("file_key checked above");
        let file_name = msg.file_name.clone().unwrap_or_else(|| "attachment".into());
        let save_path = self
            .downloads_dir
            .join(format!("{}-{}", msg.message_id, file_name));
        let display = format!("{} 📎 {}", msg.text, file_name).trim().to_string();
        if self.sender.download_file(&msg.message_id, key, &save_path).await {
            let prompt = format!(
                "[The user attached a file saved at {}. Read it before answering.]\n\n{}",
                save_path.display(),
                msg.text
            );
            (prompt, display, Some(save_path))
        } else {
            let prompt = format!(
                "[The user attached a file named {} but it could not be downloaded.]\n\n{}",
                file_name, msg.text
            );
            (prompt, display, None)
        }
    }

    // ── Core lifecycle ────────────────────────────────────────────────

    async fn run_task(
        self: Arc<Self>,
        chat_id: String,
        user_id: String,
        prompt: String,
        display_prompt: String,
        mode: TaskMode,
    ) -> TaskOutcome {
        self.metrics.add_gauge("metabot_active_tasks", &[], 1);
        self.audit.record(
            "task_start",
            json!({"bot": self.bot_name, "chatId": chat_id, "userId": user_id}),
        );

        let started = tokio::time::Instant::now();
        let outputs_dir = match self.outputs.prepare_dir(&chat_id).await {
            Ok(dir) => Some(dir),
            Err(e) => {
                error!(chat_id, error = %e, "Failed to prepare outputs dir");
                None
            }
        };

        let outcome = self
            .clone()
            .drive_task(&chat_id, prompt, display_prompt, mode, outputs_dir.clone())
            .await;

        self.report_outcome(&chat_id, &user_id, &outcome, started.elapsed());

        // Release the slot, clean the disk, then pull the next queued
        // message. Each drained message drains its own successor.
        {
            let mut running = self.running.lock().unwrap();
            if let Some(task) = running.remove(&chat_id) {
                if let Some(timer) = task.question_timer {
                    timer.cancel();
                }
                if let Some(control) = &task.control {
                    control.finish();
                }
            }
        }
        self.metrics.add_gauge("metabot_active_tasks", &[], -1);

        if let Some(dir) = &outputs_dir {
            self.outputs.cleanup(dir).await;
        }

        let next = {
            let mut queues = self.queues.lock().unwrap();
            queues.get_mut(&chat_id).and_then(VecDeque::pop_front)
        };
        if let Some(next) = next {
            info!(chat_id, "Starting next queued message");
            let bridge = self.clone();
            tokio::spawn(async move {
                bridge.handle_message(next).await;
            });
        }

        outcome
    }

    async fn drive_task(
        self: Arc<Self>,
        chat_id: &str,
        prompt: String,
        display_prompt: String,
        mode: TaskMode,
        outputs_dir: Option<PathBuf>,
    ) -> TaskOutcome {
        let abort = {
            let running = self.running.lock().unwrap();
            running
                .get(chat_id)
                .map(|task| task.abort.clone())
                .unwrap_or_default()
        };

        let session = self.sessions.get_session(chat_id);
        let mut processor = StreamProcessor::new(&display_prompt);
        let mut recorded_session = session.session_id.clone();

        // Initial card.
        let card_id = if mode.shows_cards() {
            match self.sender.send_card(chat_id, processor.state()).await {
                Ok(id) => {
                    if let Some(id) = &id {
                        let mut running = self.running.lock().unwrap();
                        if let Some(task) = running.get_mut(chat_id) {
                            task.card_message_id = Some(id.clone());
                        }
                    }
                    id
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "Initial card send failed");
                    None
                }
            }
        } else {
            None
        };

        // Start the agent.
        let request = ExecutionRequest {
            prompt,
            cwd: session.working_directory.clone(),
            session_id: session.session_id.clone(),
            abort: abort.clone(),
            outputs_dir: outputs_dir.clone().unwrap_or_else(|| session.working_directory.clone()),
            api_context: ApiContext {
                bot_name: self.bot_name.clone(),
                chat_id: chat_id.to_string(),
                port: self.api_port,
                secret: self.api_secret.clone(),
            },
            policy: ExecPolicy {
                allowed_tools: self.config.allowed_tools.clone(),
                max_turns: self.config.max_turns,
                model: self.config.model.clone(),
            },
        };

        let mut handle = match self.runner.start(request).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(chat_id, error = %e, "Agent start failed");
                let mut state = processor.state().clone();
                state.status = CardStatus::Error;
                state.error_message = Some(format!("Failed to start the agent: {e}"));
                let session_id = recorded_session;
                self.deliver_final_card(chat_id, card_id.as_deref(), &state, mode).await;
                return TaskOutcome {
                    final_state: state,
                    session_id,
                    duration_ms: 0,
                    timed_out: false,
                    idled_out: false,
                };
            }
        };

        let control = handle.control.clone();
        {
            let mut running = self.running.lock().unwrap();
            if let Some(task) = running.get_mut(chat_id) {
                task.control = Some(control.clone());
                task.session_id = session.session_id.clone();
            }
        }

        let limiter = RateLimiter::default();
        let started = tokio::time::Instant::now();
        let mut timed_out = false;
        let mut idled_out = false;
        let mut aborted = false;

        let overall = tokio::time::sleep(TASK_TIMEOUT);
        tokio::pin!(overall);
        let idle = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = abort.cancelled() => {
                    aborted = true;
                    break;
                }
                _ = &mut overall => {
                    timed_out = true;
                    abort.cancel();
                    break;
                }
                _ = &mut idle => {
                    idled_out = true;
                    abort.cancel();
                    break;
                }
                event = handle.events.recv() => {
                    let Some(event) = event else { break };
                    idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);

                    let is_ask = matches!(event, crate::stream::AgentEvent::AskUser { .. });
                    let state = processor.process(&event);

                    if let Some(sid) = processor.session_id() {
                        if recorded_session.as_deref() != Some(sid) {
                            recorded_session = Some(sid.to_string());
                            self.sessions.set_session_id(chat_id, sid);
                            let mut running = self.running.lock().unwrap();
                            if let Some(task) = running.get_mut(chat_id) {
                                task.session_id = Some(sid.to_string());
                            }
                        }
                    }

                    // A fresh ask-user invocation enters the question
                    // protocol; folded state alone is not enough because it
                    // keeps showing the question until an answer round-trips.
                    if is_ask {
                        if let Some(pending) = state.pending_question.clone() {
                            match mode {
                                TaskMode::Interactive => {
                                    self.clone()
                                        .begin_question(
                                            chat_id,
                                            card_id.as_deref(),
                                            &state,
                                            &pending,
                                            &control,
                                            &limiter,
                                        )
                                        .await;
                                }
                                TaskMode::Api { .. } => {
                                    control.send_answer(
                                        &pending.tool_use_id,
                                        recorded_session.as_deref(),
                                        question::auto_payload(),
                                    );
                                    processor.clear_pending_question();
                                }
                            }
                        }
                        continue;
                    }

                    // The answer (or timeout) path cleared the pending
                    // question on the running task; mirror that into the
                    // processor and drop any stale timer.
                    if processor.state().pending_question.is_some() {
                        let answered = {
                            let running = self.running.lock().unwrap();
                            running
                                .get(chat_id)
                                .map(|task| task.pending_question.is_none())
                                .unwrap_or(true)
                        };
                        if answered {
                            processor.clear_pending_question();
                        }
                    }
                    {
                        let mut running = self.running.lock().unwrap();
                        if let Some(task) = running.get_mut(chat_id) {
                            if task.pending_question.is_none() {
                                if let Some(timer) = task.question_timer.take() {
                                    timer.cancel();
                                }
                            }
                        }
                    }

                    if processor.state().is_terminal() {
                        break;
                    }

                    if let Some(card_id) = &card_id {
                        let sender = self.sender.clone();
                        let card_id = card_id.clone();
                        let state = processor.state().clone();
                        limiter
                            .schedule(Box::new(move || {
                                Box::pin(async move {
                                    if let Err(e) = sender.update_card(&card_id, &state).await {
                                        warn!(error = %e, "Throttled card update failed");
                                    }
                                })
                            }))
                            .await;
                    }
                }
            }
        }

        // Drop any coalesced update and wait the window out so the final
        // card is not throttled by the platform.
        limiter.cancel_and_wait().await;

        let mut final_state = processor.state().clone();
        final_state.pending_question = None;
        if !final_state.is_terminal() {
            let (status, message) = if timed_out {
                (CardStatus::Error, Some("Task timed out (1 hour limit)".to_string()))
            } else if idled_out {
                (
                    CardStatus::Error,
                    Some("Task aborted: no activity for 5 minutes".to_string()),
                )
            } else if aborted {
                (CardStatus::Error, Some("Task was stopped".to_string()))
            } else if !final_state.response_text.is_empty() {
                (CardStatus::Complete, None)
            } else {
                (
                    CardStatus::Error,
                    Some("Claude session ended unexpectedly".to_string()),
                )
            };
            final_state.status = status;
            final_state.error_message = message;
        }

        self.deliver_final_card(chat_id, card_id.as_deref(), &final_state, mode).await;

        if mode.shows_cards() {
            if let Some(dir) = &outputs_dir {
                outfiles::send_output_files(
                    self.sender.as_ref(),
                    &self.outputs,
                    chat_id,
                    dir,
                    &processor,
                    &final_state,
                )
                .await;
            }
        }

        TaskOutcome {
            final_state,
            session_id: recorded_session,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
            idled_out,
        }
    }

    /// Deliver the terminal card, retrying with backoff and falling back to
    /// plain text so the user always sees an ending.
    async fn deliver_final_card(
        &self,
        chat_id: &str,
        card_id: Option<&str>,
        state: &CardState,
        mode: TaskMode,
    ) {
        if !mode.shows_cards() {
            return;
        }

        if let Some(card_id) = card_id {
            for attempt in 1..=FINAL_CARD_ATTEMPTS {
                match self.sender.update_card(card_id, state).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(chat_id, attempt, error = %e, "Final card update failed");
                        if attempt < FINAL_CARD_ATTEMPTS {
                            let backoff = FINAL_CARD_BACKOFF
                                .get(attempt as usize - 1)
                                .copied()
                                .unwrap_or(Duration::from_secs(8));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }

        // All card attempts failed (or there never was a card): plain text.
        let text = match state.status {
            CardStatus::Complete => {
                format!("✅ {}", truncate_chars(&state.response_text, FALLBACK_TEXT_MAX))
            }
            _ => format!(
                "❌ {}",
                state.error_message.as_deref().unwrap_or("Task failed")
            ),
        };
        if let Err(e) = self.sender.send_text(chat_id, &text).await {
            error!(chat_id, error = %e, "Plain-text fallback failed too");
        }
    }

    // ── Question protocol ─────────────────────────────────────────────

    async fn begin_question(
        self: Arc<Self>,
        chat_id: &str,
        card_id: Option<&str>,
        state: &CardState,
        pending: &PendingQuestion,
        control: &ExecutionControl,
        limiter: &RateLimiter,
    ) {
        let timer = CancellationToken::new();
        {
            let mut running = self.running.lock().unwrap();
            if let Some(task) = running.get_mut(chat_id) {
                task.pending_question = Some(pending.clone());
                if let Some(old) = task.question_timer.replace(timer.clone()) {
                    old.cancel();
                }
            }
        }

        // Push the options out immediately; a throttled question is a
        // terrible user experience.
        limiter.flush().await;
        if let Some(card_id) = card_id {
            if let Err(e) = self.sender.update_card(card_id, state).await {
                warn!(chat_id, error = %e, "Question card update failed");
            }
        }

        let bridge = self.clone();
        let chat_id = chat_id.to_string();
        let control = control.clone();
        let tool_use_id = pending.tool_use_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(QUESTION_TIMEOUT) => {
                    let session_id = {
                        let mut running = bridge.running.lock().unwrap();
                        match running.get_mut(&chat_id) {
                            Some(task)
                                if task
                                    .pending_question
                                    .as_ref()
                                    .is_some_and(|p| p.tool_use_id == tool_use_id) =>
                            {
                                task.pending_question = None;
                                task.question_timer = None;
                                Some(task.session_id.clone())
                            }
                            _ => None,
                        }
                    };
                    if let Some(session_id) = session_id {
                        info!(chat_id, "Question timed out, auto-answering");
                        control.send_answer(
                            &tool_use_id,
                            session_id.as_deref(),
                            question::timeout_payload(),
                        );
                    }
                }
            }
        });
    }

    // ── Reporting ─────────────────────────────────────────────────────

    fn report_outcome(
        &self,
        chat_id: &str,
        user_id: &str,
        outcome: &TaskOutcome,
        elapsed: Duration,
    ) {
        let state = &outcome.final_state;
        let success = state.status == CardStatus::Complete;
        let duration_ms = state.duration_ms.unwrap_or(elapsed.as_millis() as u64);
        let cost = state.cost_usd.unwrap_or(0.0);

        let audit_event = if outcome.timed_out {
            "task_timeout"
        } else if outcome.idled_out {
            "task_idle_timeout"
        } else if success {
            "task_complete"
        } else {
            "task_error"
        };
        self.audit.record(
            audit_event,
            json!({
                "bot": self.bot_name,
                "chatId": chat_id,
                "userId": user_id,
                "costUsd": cost,
                "durationMs": duration_ms,
                "error": state.error_message,
            }),
        );

        self.costs.record(&self.bot_name, user_id, success, cost, duration_ms);

        self.metrics.inc_counter("metabot_tasks_total", &[]);
        self.metrics.inc_counter(
            "metabot_tasks_by_status",
            &[("status", if success { "success" } else { "error" })],
        );
        self.metrics.observe(
            "metabot_task_duration_seconds",
            DURATION_BUCKETS,
            duration_ms as f64 / 1000.0,
        );
        if cost > 0.0 {
            self.metrics.observe("metabot_task_cost_usd", COST_BUCKETS, cost);
        }
    }

    pub(crate) async fn notice(
        &self,
        chat_id: &str,
        title: &str,
        content: &str,
        color: NoticeColor,
    ) {
        if let Err(e) = self
            .sender
            .send_text_notice(chat_id, title, content, color)
            .await
        {
            warn!(chat_id, title, error = %e, "Notice send failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self, chat_id: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(chat_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

struct TaskOutcome {
    final_state: CardState,
    session_id: Option<String>,
    duration_ms: u64,
    timed_out: bool,
    idled_out: bool,
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

#[allow(dead_code)]
fn _probe_send(b: std::sync::Arc<MessageBridge>) {
    fn check<F: std::future::Future<Output = TaskOutcome> + Send>(_: F) {}
    check(b.drive_task("c", String::new(), String::new(), TaskMode::Interactive, None));
    fn check2<F: std::future::Future<Output = TaskOutcome> + Send>(_: F) {}
    check2(b.clone().run_task(
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        TaskMode::Interactive,
    ));
}

#[cfg(test)]
mod tests;
