//! In-process metrics registry and audit log.
//!
//! Write-mostly: the bridge and scheduler record, readers (the `/api/metrics`
//! route, tests) accept whatever snapshot they get. The exposition format is
//! the Prometheus text format.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// Histogram buckets for task duration in seconds.
pub const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

/// Histogram buckets for task cost in USD.
pub const COST_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 20.0];

type Labels<'a> = &'a [(&'a str, &'a str)];

#[derive(Default)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<String, BTreeMap<String, u64>>,
    gauges: BTreeMap<String, BTreeMap<String, i64>>,
    histograms: BTreeMap<String, Histogram>,
}

/// Counter/gauge/histogram registry.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, labels: Labels<'_>) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: Labels<'_>, by: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(label_string(labels))
            .or_insert(0) += by;
    }

    pub fn add_gauge(&self, name: &str, labels: Labels<'_>, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .entry(label_string(labels))
            .or_insert(0) += delta;
    }

    pub fn observe(&self, name: &str, buckets: &[f64], value: f64) {
        let mut inner = self.inner.lock().unwrap();
        let hist = inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram {
                buckets: buckets.to_vec(),
                counts: vec![0; buckets.len()],
                sum: 0.0,
                count: 0,
            });
        for (i, bound) in hist.buckets.iter().enumerate() {
            if value <= *bound {
                hist.counts[i] += 1;
            }
        }
        hist.sum += value;
        hist.count += 1;
    }

    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .counters
            .get(name)
            .and_then(|series| series.get(&label_string(labels)))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner
            .gauges
            .get(name)
            .and_then(|series| series.get(&label_string(labels)))
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();

        for (name, series) in &inner.counters {
            out.push_str(&format!("# TYPE {name} counter\n"));
            for (labels, value) in series {
                out.push_str(&format!("{name}{labels} {value}\n"));
            }
        }
        for (name, series) in &inner.gauges {
            out.push_str(&format!("# TYPE {name} gauge\n"));
            for (labels, value) in series {
                out.push_str(&format!("{name}{labels} {value}\n"));
            }
        }
        for (name, hist) in &inner.histograms {
            out.push_str(&format!("# TYPE {name} histogram\n"));
            for (bound, count) in hist.buckets.iter().zip(&hist.counts) {
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {count}\n"));
            }
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", hist.count));
            out.push_str(&format!("{name}_sum {}\n", hist.sum));
            out.push_str(&format!("{name}_count {}\n", hist.count));
        }
        out
    }
}

fn label_string(labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    pairs.sort();
    format!("{{{}}}", pairs.join(","))
}

// ── Audit ─────────────────────────────────────────────────────────────

/// How many audit events the in-memory ring keeps.
const AUDIT_RING_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp_ms: i64,
    pub event: String,
    pub fields: Value,
}

/// Structured audit trail. Every record also lands in tracing under the
/// `audit` target so it reaches the normal log pipeline.
#[derive(Default)]
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &str, fields: Value) {
        info!(target: "audit", event, fields = %fields, "audit");
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= AUDIT_RING_SIZE {
            ring.pop_front();
        }
        ring.push_back(AuditEvent {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event: event.to_string(),
            fields,
        });
    }

    pub fn recent(&self) -> Vec<AuditEvent> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = Metrics::new();
        metrics.inc_counter("metabot_tasks_total", &[]);
        metrics.inc_counter("metabot_tasks_by_status", &[("status", "success")]);
        metrics.inc_counter("metabot_tasks_by_status", &[("status", "success")]);
        metrics.inc_counter("metabot_tasks_by_status", &[("status", "error")]);

        assert_eq!(metrics.counter_value("metabot_tasks_total", &[]), 1);
        assert_eq!(
            metrics.counter_value("metabot_tasks_by_status", &[("status", "success")]),
            2
        );
        assert_eq!(
            metrics.counter_value("metabot_tasks_by_status", &[("status", "error")]),
            1
        );
    }

    #[test]
    fn gauges_go_up_and_down() {
        let metrics = Metrics::new();
        metrics.add_gauge("metabot_active_tasks", &[], 1);
        metrics.add_gauge("metabot_active_tasks", &[], 1);
        metrics.add_gauge("metabot_active_tasks", &[], -1);
        assert_eq!(metrics.gauge_value("metabot_active_tasks", &[]), 1);
    }

    #[test]
    fn exposition_contains_series_and_histogram() {
        let metrics = Metrics::new();
        metrics.inc_counter("metabot_tasks_total", &[]);
        metrics.observe("metabot_task_duration_seconds", DURATION_BUCKETS, 2.5);

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE metabot_tasks_total counter"));
        assert!(text.contains("metabot_tasks_total 1"));
        assert!(text.contains("metabot_task_duration_seconds_bucket{le=\"5\"} 1"));
        assert!(text.contains("metabot_task_duration_seconds_bucket{le=\"1\"} 0"));
        assert!(text.contains("metabot_task_duration_seconds_count 1"));
    }

    #[test]
    fn audit_ring_keeps_recent_events() {
        let audit = AuditLog::new();
        audit.record("task_start", json!({"chatId": "c1"}));
        audit.record("task_complete", json!({"chatId": "c1"}));

        let events = audit.recent();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, "task_complete");
        assert_eq!(events[1].fields["chatId"], "c1");
    }
}
