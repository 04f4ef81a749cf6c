//! # Offload scheduler
//!
//! ## Responsibility
//! Run CPU-bound jobs (signal parsing, classification) on a fixed-size pool
//! so the async request handlers never execute compute themselves.
//!
//! ## Guarantees
//! - Non-blocking submit: [`OffloadScheduler::submit`] returns a handle
//!   immediately; the queue is unbounded so nothing is ever shed.
//! - FIFO: jobs are taken from a single queue in submission order by the
//!   next free worker, so no submitted job waits forever behind later ones.
//! - Bounded parallelism: at most `workers` jobs run at once, each on
//!   Tokio's blocking thread pool via `spawn_blocking`.
//! - Contained failure: a job that returns `Err` or panics resolves its
//!   handle to [`OffloadError::JobFailed`] / [`OffloadError::Panicked`];
//!   the worker survives.
//!
//! ## NOT Responsible For
//! - Retrying failed jobs
//! - Substituting fallback results (see `pipeline`)
//! - Timeouts: a job that never returns occupies its worker indefinitely

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics;

/// A queued unit of work. The closure owns its input and its reply channel.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Offload failure modes.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OffloadError {
    /// The pool was shut down before the job could run.
    #[error("offload pool closed")]
    PoolClosed,

    /// The job ran and returned an error.
    #[error("offload job '{job}' failed: {reason}")]
    JobFailed {
        /// Job label given at submission.
        job: &'static str,
        /// Error text returned by the job.
        reason: String,
    },

    /// The job panicked.
    #[error("offload job '{job}' panicked: {reason}")]
    Panicked {
        /// Job label given at submission.
        job: &'static str,
        /// Panic payload text.
        reason: String,
    },
}

/// Pending result of a submitted job.
///
/// Await it directly or call [`OffloadHandle::wait`]. Dropping the handle
/// does not cancel the job; its result is discarded.
#[must_use = "an offload handle does nothing unless awaited"]
pub struct OffloadHandle<T> {
    rx: oneshot::Receiver<Result<T, OffloadError>>,
}

impl<T> OffloadHandle<T> {
    /// Wait for the job to finish.
    ///
    /// # Errors
    ///
    /// Returns the job's [`OffloadError`], or [`OffloadError::PoolClosed`]
    /// if the pool dropped the job without running it.
    pub async fn wait(self) -> Result<T, OffloadError> {
        self.await
    }
}

impl<T> Future for OffloadHandle<T> {
    type Output = Result<T, OffloadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(OffloadError::PoolClosed)))
    }
}

/// Counters shared by the scheduler and its workers.
#[derive(Debug, Default)]
struct PoolStats {
    queued: AtomicUsize,
    busy: AtomicUsize,
    alive_workers: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed-size worker pool for CPU-bound jobs.
///
/// Cheaply cloneable; all clones submit to the same queue.
///
/// # Example
///
/// ```no_run
/// use dream_decoder::offload::OffloadScheduler;
/// # #[tokio::main]
/// # async fn main() {
/// let pool = OffloadScheduler::new(2);
/// let handle = pool.submit("sum", || Ok::<_, String>((1..=10u64).sum::<u64>()));
/// assert_eq!(handle.await, Ok(55));
/// # }
/// ```
#[derive(Clone)]
pub struct OffloadScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    stats: Arc<PoolStats>,
    workers: usize,
}

impl OffloadScheduler {
    /// Create a pool with `workers` workers (at least one).
    ///
    /// Must be called from within a Tokio runtime: the worker loops are
    /// spawned immediately.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let stats = Arc::new(PoolStats::default());

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let stats = Arc::clone(&stats);
            stats.alive_workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { break };

                    stats.queued.fetch_sub(1, Ordering::SeqCst);
                    metrics::set_offload_queue_depth(stats.queued.load(Ordering::Relaxed) as i64);
                    stats.busy.fetch_add(1, Ordering::SeqCst);
                    // Panics are caught inside the job; a JoinError here means
                    // the blocking pool itself is shutting down.
                    if let Err(e) = tokio::task::spawn_blocking(job).await {
                        warn!(worker_id, error = %e, "offload worker lost a job");
                    }
                    stats.busy.fetch_sub(1, Ordering::SeqCst);
                }
                stats.alive_workers.fetch_sub(1, Ordering::SeqCst);
                debug!(worker_id, "offload worker exiting");
            });
        }

        info!(workers, "offload pool started");

        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                stats,
                workers,
            }),
        }
    }

    /// Queue `f` and return a handle to its result.
    ///
    /// Never blocks. `label` names the job in logs and errors.
    pub fn submit<F, T, E>(&self, label: &'static str, f: F) -> OffloadHandle<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let stats = Arc::clone(&self.inner.stats);

        let job: Job = Box::new(move || {
            let result = match std::panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(value)
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    Err(OffloadError::JobFailed {
                        job: label,
                        reason: e.to_string(),
                    })
                }
                Err(payload) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    Err(OffloadError::Panicked {
                        job: label,
                        reason: crate::panic_message(payload.as_ref()),
                    })
                }
            };
            // Receiver gone means the caller stopped caring.
            let _ = reply_tx.send(result);
        });

        let sender = self.inner.tx.lock().clone();
        match sender {
            Some(tx) => {
                self.inner.stats.queued.fetch_add(1, Ordering::SeqCst);
                if tx.send(job).is_err() {
                    // Dropping the job drops reply_tx; the handle resolves to PoolClosed.
                    self.inner.stats.queued.fetch_sub(1, Ordering::SeqCst);
                    warn!(job = label, "offload submit after workers exited");
                } else {
                    metrics::set_offload_queue_depth(self.queued() as i64);
                }
            }
            None => {
                debug!(job = label, "offload submit after shutdown");
            }
        }

        OffloadHandle { rx: reply_rx }
    }

    /// Stop accepting jobs. Already queued jobs still run; workers exit
    /// once the queue is drained.
    pub fn shutdown(&self) {
        if self.inner.tx.lock().take().is_some() {
            info!("offload pool shutting down");
        }
    }

    /// `true` while the pool accepts jobs and at least one worker is alive.
    pub fn is_running(&self) -> bool {
        self.inner.tx.lock().is_some() && self.alive_workers() > 0
    }

    /// Configured pool size.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Workers whose loop has not exited.
    pub fn alive_workers(&self) -> usize {
        self.inner.stats.alive_workers.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.inner.stats.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently running.
    pub fn busy(&self) -> usize {
        self.inner.stats.busy.load(Ordering::SeqCst)
    }

    /// Jobs that returned `Ok`.
    pub fn completed(&self) -> u64 {
        self.inner.stats.completed.load(Ordering::Relaxed)
    }

    /// Jobs that returned `Err` or panicked.
    pub fn failed(&self) -> u64 {
        self.inner.stats.failed.load(Ordering::Relaxed)
    }
}
