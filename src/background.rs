//! # Background task runner
//!
//! ## Responsibility
//! Launch work that must not delay the in-flight response: persisting a
//! prediction, generating a dream image. The caller gets no handle.
//!
//! ## Guarantees
//! - Fire-and-forget: [`BackgroundTaskRunner::spawn`] returns immediately.
//! - Contained failure: an `Err` or a panic inside a task is caught, logged,
//!   counted and appended to a bounded dead-letter list. Nothing propagates
//!   to the spawner.
//! - At most once: tasks are never retried or re-queued.
//! - Detached: tasks keep running when the originating client disconnects.
//!
//! ## NOT Responsible For
//! - Retrying or replaying dead letters
//! - Ordering between tasks

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metrics;

/// Default number of dead letters kept before the oldest is evicted.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 100;

/// Identity of one spawned task.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTask {
    /// Task name, used as a metrics label.
    pub name: String,
    /// When the task was spawned.
    pub created_at: DateTime<Utc>,
}

/// A task that failed, kept for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// The failed task.
    pub task: BackgroundTask,
    /// Error or panic text.
    pub error: String,
    /// When the failure was observed.
    pub failed_at: DateTime<Utc>,
}

/// Counters for spawned tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackgroundStats {
    /// Tasks handed to [`BackgroundTaskRunner::spawn`].
    pub spawned: u64,
    /// Tasks that returned `Ok(())`.
    pub succeeded: u64,
    /// Tasks that returned `Err` or panicked.
    pub failed: u64,
    /// Tasks not yet finished.
    pub in_flight: usize,
}

/// Fire-and-forget task launcher.
///
/// Cheaply cloneable; all clones share counters and dead letters.
#[derive(Clone)]
pub struct BackgroundTaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    in_flight: AtomicUsize,
    spawned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
    idle: Notify,
}

impl Inner {
    fn record_failure(&self, task: BackgroundTask, error: String) {
        warn!(task = %task.name, error = %error, "background task failed");
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::inc_background_task(&task.name, "failed");

        if self.dead_letter_capacity == 0 {
            return;
        }
        let mut letters = self.dead_letters.lock();
        if letters.len() >= self.dead_letter_capacity {
            letters.pop_front();
        }
        letters.push_back(DeadLetter {
            task,
            error,
            failed_at: Utc::now(),
        });
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl Default for BackgroundTaskRunner {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}

impl BackgroundTaskRunner {
    /// Create a runner keeping at most `dead_letter_capacity` failures.
    pub fn new(dead_letter_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicUsize::new(0),
                spawned: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dead_letters: Mutex::new(VecDeque::new()),
                dead_letter_capacity,
                idle: Notify::new(),
            }),
        }
    }

    /// Run `task` in the background.
    ///
    /// Returns before the task starts. Outside a Tokio runtime the task
    /// cannot run; it is recorded as a dead letter instead.
    pub fn spawn<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let meta = BackgroundTask {
            name: name.into(),
            created_at: Utc::now(),
        };
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.inner
                    .record_failure(meta, format!("no runtime available: {e}"));
                return;
            }
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        debug!(task = %meta.name, "background task spawned");

        runtime.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    inner.succeeded.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_background_task(&meta.name, "ok");
                    debug!(task = %meta.name, "background task finished");
                }
                Ok(Err(e)) => inner.record_failure(meta, e.to_string()),
                Err(payload) => {
                    let msg = format!("panicked: {}", crate::panic_message(payload.as_ref()));
                    inner.record_failure(meta, msg);
                }
            }
            inner.finish();
        });
    }

    /// Wait until no task is in flight, or `timeout` elapses.
    ///
    /// Returns `true` if the runner went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Snapshot of the task counters.
    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            spawned: self.inner.spawned.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Recorded failures, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    /// Remove and return all recorded failures.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[tokio::test]
    async fn test_spawn_returns_before_task_completes() {
        let runner = BackgroundTaskRunner::default();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        let start = Instant::now();
        runner.spawn("slow", async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        });
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        assert!(runner.wait_idle(Duration::from_secs(2)).await);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(runner.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_failed_task_is_dead_lettered() {
        let runner = BackgroundTaskRunner::default();
        runner.spawn("persist", async { Err::<(), _>("database unavailable") });
        assert!(runner.wait_idle(Duration::from_secs(1)).await);

        let letters = runner.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task.name, "persist");
        assert_eq!(letters[0].error, "database unavailable");
        assert_eq!(runner.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let runner = BackgroundTaskRunner::default();
        let explode = true;
        runner.spawn("explode", async move {
            if explode {
                panic!("kaboom");
            }
            Ok::<(), String>(())
        });
        assert!(runner.wait_idle(Duration::from_secs(1)).await);

        let letters = runner.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("kaboom"));
        assert_eq!(runner.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_dead_letters_are_bounded() {
        let runner = BackgroundTaskRunner::new(3);
        for i in 0..10 {
            runner.spawn(format!("task-{i}"), async move { Err::<(), _>(format!("fail {i}")) });
        }
        assert!(runner.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(runner.dead_letters().len(), 3);
        assert_eq!(runner.stats().failed, 10);
    }

    #[tokio::test]
    async fn test_drain_dead_letters_empties_list() {
        let runner = BackgroundTaskRunner::default();
        runner.spawn("x", async { Err::<(), _>("nope") });
        assert!(runner.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(runner.drain_dead_letters().len(), 1);
        assert!(runner.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_on_stuck_task() {
        let runner = BackgroundTaskRunner::default();
        runner.spawn("forever", async {
            futures::future::pending::<()>().await;
            Ok::<(), String>(())
        });
        assert!(!runner.wait_idle(Duration::from_millis(50)).await);
        assert_eq!(runner.stats().in_flight, 1);
    }

    #[test]
    fn test_spawn_without_runtime_records_failure() {
        let runner = BackgroundTaskRunner::default();
        runner.spawn("orphan", async { Ok::<(), String>(()) });
        assert_eq!(runner.stats().failed, 1);
        assert_eq!(runner.stats().in_flight, 0);
        assert!(runner.dead_letters()[0].error.contains("no runtime"));
    }

    #[test]
    fn test_zero_capacity_keeps_no_dead_letters() {
        let runner = BackgroundTaskRunner::new(0);
        runner.spawn("orphan", async { Ok::<(), String>(()) });
        assert!(runner.dead_letters().is_empty());
        assert_eq!(runner.stats().failed, 1);
    }
}
