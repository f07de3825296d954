//! Coalescing rate limiter for card updates.
//!
//! Chat platforms throttle message edits aggressively, so the bridge funnels
//! every card update through a [`RateLimiter`]: the first update in a burst
//! goes out immediately, later ones within the window collapse into a single
//! pending slot (latest wins) that a timer drains when the window elapses.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default minimum interval between sends.
pub const DEFAULT_INTERVAL_MS: u64 = 1500;

/// A deferred send. Boxed so callers can capture whatever state the update
/// needs without the limiter knowing about senders or card state.
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    last_sent: Option<Instant>,
    pending: Option<Job>,
    timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}

/// Coalescing throttle. Cheap to clone; clones share the same window.
#[derive(Clone)]
pub struct RateLimiter {
    interval: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Arc::new(Mutex::new(Inner {
                last_sent: None,
                pending: None,
                timer: None,
            })),
        }
    }

    /// Schedule a send. Runs immediately when the window is open; otherwise
    /// replaces any pending job and (if needed) arms a single-shot timer for
    /// the remainder of the window.
    pub async fn schedule(&self, job: Job) {
        let run_now = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            match inner.last_sent {
                Some(last) if now.duration_since(last) < self.interval => {
                    let remaining = self.interval - now.duration_since(last);
                    inner.pending = Some(job);
                    if inner.timer.is_none() {
                        let limiter = self.clone();
                        inner.timer = Some(tokio::spawn(async move {
                            tokio::time::sleep(remaining).await;
                            limiter.fire_pending().await;
                        }));
                    }
                    None
                }
                _ => {
                    inner.last_sent = Some(now);
                    Some(job)
                }
            }
        };

        if let Some(job) = run_now {
            job().await;
        }
    }

    /// Run any pending job immediately and reset the window.
    pub async fn flush(&self) {
        let job = {
            let mut inner = self.inner.lock().await;
            inner.cancel_timer();
            if inner.pending.is_some() {
                inner.last_sent = Some(Instant::now());
            }
            inner.pending.take()
        };
        if let Some(job) = job {
            job().await;
        }
    }

    /// Drop the pending job and timer without running anything.
    pub async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        inner.cancel_timer();
        if inner.pending.take().is_some() {
            debug!("rate limiter cancelled a pending update");
        }
    }

    /// Cancel, then wait until a full interval has passed since the last
    /// send. A direct send immediately afterwards will not be throttled by
    /// the platform.
    pub async fn cancel_and_wait(&self) {
        self.cancel().await;
        let remaining = {
            let inner = self.inner.lock().await;
            inner.last_sent.and_then(|last| {
                self.interval.checked_sub(Instant::now().duration_since(last))
            })
        };
        if let Some(remaining) = remaining {
            tokio::time::sleep(remaining).await;
        }
    }

    async fn fire_pending(&self) {
        let job = {
            let mut inner = self.inner.lock().await;
            inner.timer = None;
            if inner.pending.is_some() {
                inner.last_sent = Some(Instant::now());
            }
            inner.pending.take()
        };
        if let Some(job) = job {
            job().await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_INTERVAL_MS))
    }
}
