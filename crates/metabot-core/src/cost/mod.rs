//! In-memory usage aggregation.
//!
//! Rollups are kept per bot, per user, and globally. Everything resets on
//! restart; this is operational insight, not billing.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    /// Unix milliseconds of the most recent task.
    pub last_task_at: Option<i64>,
}

impl UsageRecord {
    fn record(&mut self, success: bool, cost_usd: f64, duration_ms: u64) {
        self.total_tasks += 1;
        if success {
            self.completed_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        self.total_cost_usd += cost_usd;
        self.total_duration_ms += duration_ms;
        self.last_task_at = Some(chrono::Utc::now().timestamp_millis());
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub global: UsageRecord,
    pub by_bot: HashMap<String, UsageRecord>,
    pub by_user: HashMap<String, UsageRecord>,
}

#[derive(Default)]
struct Rollups {
    global: UsageRecord,
    by_bot: HashMap<String, UsageRecord>,
    by_user: HashMap<String, UsageRecord>,
}

/// Per-bot/per-user usage aggregation.
#[derive(Default)]
pub struct CostTracker {
    rollups: Mutex<Rollups>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bot: &str, user: &str, success: bool, cost_usd: f64, duration_ms: u64) {
        let mut rollups = self.rollups.lock().unwrap();
        rollups.global.record(success, cost_usd, duration_ms);
        rollups
            .by_bot
            .entry(bot.to_string())
            .or_default()
            .record(success, cost_usd, duration_ms);
        rollups
            .by_user
            .entry(user.to_string())
            .or_default()
            .record(success, cost_usd, duration_ms);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let rollups = self.rollups.lock().unwrap();
        UsageSnapshot {
            global: rollups.global.clone(),
            by_bot: rollups.by_bot.clone(),
            by_user: rollups.by_user.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollups_aggregate_across_dimensions() {
        let tracker = CostTracker::new();
        tracker.record("demo", "u1", true, 0.01, 1000);
        tracker.record("demo", "u2", false, 0.02, 2000);
        tracker.record("other", "u1", true, 0.03, 500);

        let snap = tracker.snapshot();
        assert_eq!(snap.global.total_tasks, 3);
        assert_eq!(snap.global.completed_tasks, 2);
        assert_eq!(snap.global.failed_tasks, 1);
        assert!((snap.global.total_cost_usd - 0.06).abs() < 1e-9);

        assert_eq!(snap.by_bot["demo"].total_tasks, 2);
        assert_eq!(snap.by_user["u1"].total_tasks, 2);
        assert!(snap.by_bot["other"].last_task_at.is_some());
    }
}
