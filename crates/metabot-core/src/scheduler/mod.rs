//! Task scheduler: one-time delayed tasks and recurring cron tasks.
//!
//! Single-process, timer-driven. Every mutation persists synchronously to
//! one JSON store so a restart recovers cleanly: pending one-time tasks
//! are re-armed (stale ones dropped), recurring tasks recompute their next
//! occurrence from the current time with **no catch-up** for fires missed
//! while the process was down.

pub mod cron;


use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::ApiTaskOptions;
use crate::registry::BotRegistry;
use crate::sender::NoticeColor;
use crate::session::write_atomic;

/// Busy-chat retry policy.
pub const MAX_RETRIES: u32 = 5;
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Largest single timer arm; longer delays re-arm in chunks.
pub const MAX_TIMER_MS: i64 = i32::MAX as i64;

/// Restored one-time tasks older than this are dropped, not fired.
const STALE_TASK_MS: i64 = 24 * 60 * 60 * 1000;

/// Finished child tasks older than this are pruned on save.
const CHILD_PRUNE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task {0} is not in a state that allows this operation")]
    InvalidState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringStatus {
    Active,
    Paused,
    Cancelled,
}

/// A one-time delayed invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub bot_name: String,
    pub chat_id: String,
    pub prompt: String,
    /// Unix milliseconds.
    pub execute_at: i64,
    #[serde(default = "default_true")]
    pub send_cards: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: TaskStatus,
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_recurring_id: Option<String>,
}

/// A repeating schedule that spawns child one-time tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTask {
    pub id: String,
    pub bot_name: String,
    pub chat_id: String,
    pub prompt: String,
    pub cron_expr: String,
    pub timezone: String,
    #[serde(default = "default_true")]
    pub send_cards: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: RecurringStatus,
    pub created_at: i64,
    pub next_execute_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_child_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ScheduleTaskRequest {
    pub bot_name: String,
    pub chat_id: String,
    pub prompt: String,
    pub delay_seconds: i64,
    pub send_cards: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduleRecurringRequest {
    pub bot_name: String,
    pub chat_id: String,
    pub prompt: String,
    pub cron_expr: String,
    pub timezone: Option<String>,
    pub send_cards: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    pub prompt: Option<String>,
    pub delay_seconds: Option<i64>,
    pub label: Option<String>,
    pub send_cards: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRecurringRequest {
    pub prompt: Option<String>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub label: Option<String>,
    pub send_cards: Option<bool>,
}

struct TimerHandle {
    token: CancellationToken,
    generation: u64,
}

struct State {
    tasks: HashMap<String, ScheduledTask>,
    recurring: HashMap<String, RecurringTask>,
    timers: HashMap<String, TimerHandle>,
    next_generation: u64,
}

struct Inner {
    registry: Arc<BotRegistry>,
    store_path: PathBuf,
    default_timezone: String,
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// Cheap-clone handle; clones share the same scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Load the store, run restart recovery, and arm timers.
    pub fn new(
        registry: Arc<BotRegistry>,
        store_path: PathBuf,
        default_timezone: String,
    ) -> Self {
        let scheduler = Self {
            inner: Arc::new(Inner {
                registry,
                store_path,
                default_timezone,
                state: Mutex::new(State {
                    tasks: HashMap::new(),
                    recurring: HashMap::new(),
                    timers: HashMap::new(),
                    next_generation: 0,
                }),
                cancel: CancellationToken::new(),
            }),
        };
        scheduler.restore();
        scheduler
    }

    /// Cancel all timers. In-flight fires finish their current step.
    pub fn destroy(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock().unwrap();
        for (_, timer) in state.timers.drain() {
            timer.token.cancel();
        }
    }

    // ── One-time tasks ────────────────────────────────────────────────

    pub fn schedule_task(&self, req: ScheduleTaskRequest) -> ScheduledTask {
        let now = now_ms();
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            bot_name: req.bot_name,
            chat_id: req.chat_id,
            prompt: req.prompt,
            execute_at: now + req.delay_seconds.max(0) * 1000,
            send_cards: req.send_cards,
            label: req.label,
            status: TaskStatus::Pending,
            created_at: now,
            retry_count: 0,
            parent_recurring_id: None,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.tasks.insert(task.id.clone(), task.clone());
            self.persist_locked(&mut state);
        }
        info!(id = task.id, execute_at = task.execute_at, "Scheduled one-time task");
        self.arm_task(task.id.clone(), task.execute_at - now);
        task
    }

    pub fn update_task(&self, id: &str, req: UpdateTaskRequest) -> Result<ScheduledTask, SchedulerError> {
        let (task, rearm) = {
            let mut state = self.inner.state.lock().unwrap();
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            if task.status != TaskStatus::Pending {
                return Err(SchedulerError::InvalidState(id.to_string()));
            }
            if let Some(prompt) = req.prompt {
                task.prompt = prompt;
            }
            if let Some(label) = req.label {
                task.label = Some(label);
            }
            if let Some(send_cards) = req.send_cards {
                task.send_cards = send_cards;
            }
            let rearm = req.delay_seconds.map(|delay| {
                task.execute_at = now_ms() + delay.max(0) * 1000;
                task.execute_at
            });
            let snapshot = task.clone();
            self.persist_locked(&mut state);
            (snapshot, rearm)
        };

        if let Some(execute_at) = rearm {
            self.arm_task(id.to_string(), execute_at - now_ms());
        }
        Ok(task)
    }

    /// Cancel a pending task. Returns `false` when there was nothing
    /// cancellable under this id.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let cancelled = match state.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                true
            }
            _ => false,
        };
        if cancelled {
            if let Some(timer) = state.timers.remove(id) {
                timer.token.cancel();
            }
            self.persist_locked(&mut state);
        }
        cancelled
    }

    pub fn get_task(&self, id: &str) -> Option<ScheduledTask> {
        self.inner.state.lock().unwrap().tasks.get(id).cloned()
    }

    /// All pending one-time tasks, soonest first.
    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let state = self.inner.state.lock().unwrap();
        let mut tasks: Vec<ScheduledTask> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.execute_at);
        tasks
    }

    pub fn task_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    // ── Recurring tasks ───────────────────────────────────────────────

    pub fn schedule_recurring(
        &self,
        req: ScheduleRecurringRequest,
    ) -> Result<RecurringTask, SchedulerError> {
        let timezone = req.timezone.unwrap_or_else(|| self.inner.default_timezone.clone());
        cron::validate(&req.cron_expr)?;
        cron::validate_timezone(&timezone)?;

        let now = now_ms();
        let next = cron::next_occurrence_ms(&req.cron_expr, &timezone, now)?;
        let task = RecurringTask {
            id: uuid::Uuid::new_v4().to_string(),
            bot_name: req.bot_name,
            chat_id: req.chat_id,
            prompt: req.prompt,
            cron_expr: req.cron_expr,
            timezone,
            send_cards: req.send_cards,
            label: req.label,
            status: RecurringStatus::Active,
            created_at: now,
            next_execute_at: next,
            last_executed_at: None,
            current_child_id: None,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.recurring.insert(task.id.clone(), task.clone());
            self.persist_locked(&mut state);
        }
        info!(
            id = task.id,
            cron = task.cron_expr,
            next = task.next_execute_at,
            "Scheduled recurring task"
        );
        self.arm_recurring(task.id.clone(), next - now);
        Ok(task)
    }

    pub fn update_recurring(
        &self,
        id: &str,
        req: UpdateRecurringRequest,
    ) -> Result<RecurringTask, SchedulerError> {
        if let Some(expr) = &req.cron_expr {
            cron::validate(expr)?;
        }
        if let Some(tz) = &req.timezone {
            cron::validate_timezone(tz)?;
        }

        let (task, rearm) = {
            let mut state = self.inner.state.lock().unwrap();
            let task = state
                .recurring
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            if task.status == RecurringStatus::Cancelled {
                return Err(SchedulerError::InvalidState(id.to_string()));
            }

            let schedule_changed = req.cron_expr.is_some() || req.timezone.is_some();
            if let Some(prompt) = req.prompt {
                task.prompt = prompt;
            }
            if let Some(expr) = req.cron_expr {
                task.cron_expr = expr;
            }
            if let Some(tz) = req.timezone {
                task.timezone = tz;
            }
            if let Some(label) = req.label {
                task.label = Some(label);
            }
            if let Some(send_cards) = req.send_cards {
                task.send_cards = send_cards;
            }

            let rearm = if schedule_changed && task.status == RecurringStatus::Active {
                let next = cron::next_occurrence_ms(&task.cron_expr, &task.timezone, now_ms())?;
                task.next_execute_at = next;
                Some(next)
            } else {
                None
            };
            let snapshot = task.clone();
            self.persist_locked(&mut state);
            (snapshot, rearm)
        };

        if let Some(next) = rearm {
            self.arm_recurring(id.to_string(), next - now_ms());
        }
        Ok(task)
    }

    pub fn pause_recurring(&self, id: &str) -> Result<RecurringTask, SchedulerError> {
        let mut state = self.inner.state.lock().unwrap();
        let task = state
            .recurring
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        if task.status != RecurringStatus::Active {
            return Err(SchedulerError::InvalidState(id.to_string()));
        }
        task.status = RecurringStatus::Paused;
        let snapshot = task.clone();
        if let Some(timer) = state.timers.remove(id) {
            timer.token.cancel();
        }
        self.persist_locked(&mut state);
        Ok(snapshot)
    }

    pub fn resume_recurring(&self, id: &str) -> Result<RecurringTask, SchedulerError> {
        let (task, next) = {
            let mut state = self.inner.state.lock().unwrap();
            let task = state
                .recurring
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            if task.status != RecurringStatus::Paused {
                return Err(SchedulerError::InvalidState(id.to_string()));
            }
            let next = cron::next_occurrence_ms(&task.cron_expr, &task.timezone, now_ms())?;
            task.status = RecurringStatus::Active;
            task.next_execute_at = next;
            let snapshot = task.clone();
            self.persist_locked(&mut state);
            (snapshot, next)
        };
        self.arm_recurring(id.to_string(), next - now_ms());
        Ok(task)
    }

    pub fn cancel_recurring(&self, id: &str) -> Result<(), SchedulerError> {
        let child = {
            let mut state = self.inner.state.lock().unwrap();
            let task = state
                .recurring
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            if task.status == RecurringStatus::Cancelled {
                return Err(SchedulerError::InvalidState(id.to_string()));
            }
            task.status = RecurringStatus::Cancelled;
            let child = task.current_child_id.take();
            if let Some(timer) = state.timers.remove(id) {
                timer.token.cancel();
            }
            self.persist_locked(&mut state);
            child
        };
        if let Some(child_id) = child {
            self.cancel_task(&child_id);
        }
        Ok(())
    }

    pub fn get_recurring(&self, id: &str) -> Option<RecurringTask> {
        self.inner.state.lock().unwrap().recurring.get(id).cloned()
    }

    /// All non-cancelled recurring tasks.
    pub fn list_recurring(&self) -> Vec<RecurringTask> {
        let state = self.inner.state.lock().unwrap();
        let mut tasks: Vec<RecurringTask> = state
            .recurring
            .values()
            .filter(|t| t.status != RecurringStatus::Cancelled)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.next_execute_at);
        tasks
    }

    // ── Firing ────────────────────────────────────────────────────────

    async fn fire_task(&self, id: &str) {
        let task = {
            let state = self.inner.state.lock().unwrap();
            state.tasks.get(id).cloned()
        };
        let Some(task) = task else { return };
        if task.status != TaskStatus::Pending {
            return;
        }

        let Some(bot) = self.inner.registry.get(&task.bot_name) else {
            warn!(id, bot = task.bot_name, "Bot not found at fire time");
            self.set_task_status(id, TaskStatus::Failed);
            return;
        };

        if bot.bridge.is_busy(&task.chat_id) {
            if task.retry_count < MAX_RETRIES {
                let retries = {
                    let mut state = self.inner.state.lock().unwrap();
                    let Some(task) = state.tasks.get_mut(id) else { return };
                    task.retry_count += 1;
                    let retries = task.retry_count;
                    self.persist_locked(&mut state);
                    retries
                };
                info!(id, retries, "Chat busy, retrying scheduled task");
                self.arm_task(id.to_string(), RETRY_DELAY.as_millis() as i64);
            } else {
                warn!(id, "Chat still busy after retries, giving up");
                self.set_task_status(id, TaskStatus::Failed);
                let _ = bot
                    .sender
                    .send_text_notice(
                        &task.chat_id,
                        "Scheduled Task Failed",
                        "The chat stayed busy through every retry. Run it manually when the \
                         current task finishes.",
                        NoticeColor::Orange,
                    )
                    .await;
            }
            return;
        }

        self.set_task_status(id, TaskStatus::Executing);
        info!(id, bot = task.bot_name, chat_id = task.chat_id, "Firing scheduled task");

        let result = bot
            .bridge
            .clone()
            .execute_api_task(ApiTaskOptions {
                prompt: task.prompt.clone(),
                chat_id: task.chat_id.clone(),
                user_id: "scheduler".into(),
                send_cards: task.send_cards,
            })
            .await;

        if result.success {
            self.set_task_status(id, TaskStatus::Completed);
        } else {
            warn!(id, error = ?result.error, "Scheduled task execution failed");
            self.set_task_status(id, TaskStatus::Failed);
        }
    }

    async fn fire_recurring(&self, id: &str) {
        let recurring = {
            let state = self.inner.state.lock().unwrap();
            state.recurring.get(id).cloned()
        };
        let Some(recurring) = recurring else { return };
        if recurring.status != RecurringStatus::Active {
            return;
        }

        // Spawn a synthetic child and run it through the one-time path so
        // busy-retry and failure semantics are shared.
        let now = now_ms();
        let child = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            bot_name: recurring.bot_name.clone(),
            chat_id: recurring.chat_id.clone(),
            prompt: recurring.prompt.clone(),
            execute_at: now,
            send_cards: recurring.send_cards,
            label: recurring.label.as_ref().map(|l| format!("{l} (recurring)")),
            status: TaskStatus::Pending,
            created_at: now,
            retry_count: 0,
            parent_recurring_id: Some(id.to_string()),
        };
        let child_id = child.id.clone();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.tasks.insert(child_id.clone(), child);
            if let Some(rec) = state.recurring.get_mut(id) {
                rec.current_child_id = Some(child_id.clone());
            }
            self.persist_locked(&mut state);
        }

        self.fire_task(&child_id).await;

        let next = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(rec) = state.recurring.get_mut(id) else { return };
            rec.last_executed_at = Some(now_ms());
            rec.current_child_id = None;
            let next = if rec.status == RecurringStatus::Active {
                match cron::next_occurrence_ms(&rec.cron_expr, &rec.timezone, now_ms()) {
                    Ok(next) => {
                        rec.next_execute_at = next;
                        Some(next)
                    }
                    Err(e) => {
                        warn!(id, error = %e, "Failed to compute next occurrence");
                        None
                    }
                }
            } else {
                None
            };
            self.persist_locked(&mut state);
            next
        };

        if let Some(next) = next {
            self.arm_recurring(id.to_string(), next - now_ms());
        }
    }

    fn set_task_status(&self, id: &str, status: TaskStatus) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(id) {
            task.status = status;
            self.persist_locked(&mut state);
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    fn arm_task(&self, id: String, delay_ms: i64) {
        self.arm(id.clone(), delay_ms, move |scheduler| async move {
            scheduler.fire_task(&id).await;
        });
    }

    fn arm_recurring(&self, id: String, delay_ms: i64) {
        self.arm(id.clone(), delay_ms, move |scheduler| async move {
            scheduler.fire_recurring(&id).await;
        });
    }

    fn arm<F, Fut>(&self, key: String, delay_ms: i64, fire: F)
    where
        F: FnOnce(TaskScheduler) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let token = self.inner.cancel.child_token();
        let generation = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_generation += 1;
            let generation = state.next_generation;
            if let Some(old) = state
                .timers
                .insert(key.clone(), TimerHandle { token: token.clone(), generation })
            {
                old.token.cancel();
            }
            generation
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep_long(delay_ms) => {}
            }
            {
                // Only this arming's entry is removed; a newer re-arm under
                // the same key keeps its own handle.
                let mut state = scheduler.inner.state.lock().unwrap();
                if state.timers.get(&key).is_some_and(|t| t.generation == generation) {
                    state.timers.remove(&key);
                }
            }
            fire(scheduler).await;
        });
    }

    // ── Persistence & recovery ────────────────────────────────────────

    fn persist_locked(&self, state: &mut State) {
        let cutoff = now_ms() - CHILD_PRUNE_MS;
        state.tasks.retain(|_, task| {
            !(task.parent_recurring_id.is_some()
                && matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
                && task.created_at < cutoff)
        });

        let mut tasks: Vec<&ScheduledTask> = state.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        let mut recurring: Vec<&RecurringTask> = state.recurring.values().collect();
        recurring.sort_by_key(|t| t.created_at);

        let json = serde_json::json!({
            "tasks": tasks,
            "recurringTasks": recurring,
        });
        let pretty = match serde_json::to_string_pretty(&json) {
            Ok(pretty) => pretty,
            Err(e) => {
                warn!(error = %e, "Failed to serialize scheduler store");
                return;
            }
        };
        if let Err(e) = write_atomic(&self.inner.store_path, &pretty) {
            warn!(path = %self.inner.store_path.display(), error = %e, "Failed to persist scheduler store");
        }
    }

    fn restore(&self) {
        let Some((tasks, recurring)) = load_store(&self.inner.store_path) else {
            return;
        };

        let now = now_ms();
        let mut to_arm_tasks: Vec<(String, i64)> = Vec::new();
        let mut to_arm_recurring: Vec<(String, i64)> = Vec::new();

        {
            let mut state = self.inner.state.lock().unwrap();

            for task in tasks {
                if task.status == TaskStatus::Pending && task.execute_at < now - STALE_TASK_MS {
                    info!(id = task.id, "Dropping stale scheduled task");
                    continue;
                }
                if task.status == TaskStatus::Pending {
                    to_arm_tasks.push((task.id.clone(), task.execute_at - now));
                }
                state.tasks.insert(task.id.clone(), task);
            }

            for mut rec in recurring {
                match rec.status {
                    RecurringStatus::Cancelled => continue,
                    RecurringStatus::Paused => {
                        state.recurring.insert(rec.id.clone(), rec);
                    }
                    RecurringStatus::Active => {
                        // A child still pending/executing means the process
                        // died mid-fire.
                        if let Some(child_id) = rec.current_child_id.take() {
                            if let Some(child) = state.tasks.get_mut(&child_id) {
                                if matches!(child.status, TaskStatus::Pending | TaskStatus::Executing) {
                                    warn!(id = child_id, "Marking orphaned child task failed");
                                    child.status = TaskStatus::Failed;
                                    to_arm_tasks.retain(|(id, _)| id != &child_id);
                                }
                            }
                        }
                        match cron::next_occurrence_ms(&rec.cron_expr, &rec.timezone, now) {
                            Ok(next) => {
                                rec.next_execute_at = next;
                                to_arm_recurring.push((rec.id.clone(), next - now));
                            }
                            Err(e) => {
                                warn!(id = rec.id, error = %e, "Recurring task failed to restore schedule");
                            }
                        }
                        state.recurring.insert(rec.id.clone(), rec);
                    }
                }
            }

            self.persist_locked(&mut state);
        }

        let restored = to_arm_tasks.len() + to_arm_recurring.len();
        if restored > 0 {
            info!(count = restored, "Restored scheduled tasks");
        }
        for (id, delay) in to_arm_tasks {
            self.arm_task(id, delay);
        }
        for (id, delay) in to_arm_recurring {
            self.arm_recurring(id, delay);
        }
    }
}

/// Sleep `delay_ms`, re-arming in chunks below the timer ceiling. Each
/// iteration recomputes the remainder, so chained arms do not drift.
async fn sleep_long(delay_ms: i64) {
    let target = tokio::time::Instant::now()
        + Duration::from_millis(delay_ms.max(0) as u64);
    loop {
        let now = tokio::time::Instant::now();
        if now >= target {
            return;
        }
        let remaining = (target - now).as_millis() as i64;
        let chunk = remaining.min(MAX_TIMER_MS);
        tokio::time::sleep(Duration::from_millis(chunk as u64)).await;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Load `{tasks, recurringTasks}`; a legacy bare array of one-time tasks
/// still loads as `{tasks: [...], recurringTasks: []}`.
fn load_store(path: &std::path::Path) -> Option<(Vec<ScheduledTask>, Vec<RecurringTask>)> {
    let content = std::fs::read_to_string(path).ok()?;
    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Scheduler store is not valid JSON");
            return None;
        }
    };

    if value.is_array() {
        match serde_json::from_value::<Vec<ScheduledTask>>(value) {
            Ok(tasks) => return Some((tasks, Vec::new())),
            Err(e) => {
                warn!(error = %e, "Legacy scheduler store failed to parse");
                return None;
            }
        }
    }

    let tasks = value
        .get("tasks")
        .cloned()
        .map(serde_json::from_value::<Vec<ScheduledTask>>)
        .transpose()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Scheduler store tasks failed to parse");
            None
        })
        .unwrap_or_default();
    let recurring = value
        .get("recurringTasks")
        .cloned()
        .map(serde_json::from_value::<Vec<RecurringTask>>)
        .transpose()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Scheduler store recurring tasks failed to parse");
            None
        })
        .unwrap_or_default();
    Some((tasks, recurring))
}
