//! Admission control
//!
//! Sliding-window rate limiting keyed by client identity (the transport
//! address). A [`RateGate`] is an owned component: construct one at startup
//! and inject it into the request layer.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//! use dream_decoder::admission::{Admission, RateGate};
//!
//! let gate = RateGate::new(100, Duration::from_secs(60));
//!
//! match gate.admit("203.0.113.7", Instant::now()) {
//!     Admission::Allowed { remaining, .. } => println!("{remaining} left"),
//!     Admission::Rejected { retry_after } => println!("retry in {retry_after:?}"),
//! }
//! ```

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Shortest interval [`RateGate::spawn_sweeper`] will tick at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request was counted and may proceed.
    Allowed {
        /// Window capacity, for the `X-RateLimit-Limit` header.
        limit: usize,
        /// Requests left in the window after this one.
        remaining: usize,
    },
    /// The window is full.
    Rejected {
        /// Time until the oldest counted request leaves the window.
        retry_after: Duration,
    },
}

impl Admission {
    /// `true` for [`Admission::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Admission timestamps for one identity, oldest first.
#[derive(Debug, Default)]
pub struct ClientWindow {
    timestamps: VecDeque<Instant>,
}

impl ClientWindow {
    /// Drop every timestamp at or before `cutoff`.
    fn prune(&mut self, cutoff: Option<Instant>) {
        let Some(cutoff) = cutoff else { return };
        while self.timestamps.front().is_some_and(|t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Number of counted requests.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// `true` if no request is counted.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Usage snapshot for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Requests counted in the trailing window.
    pub used: usize,
    /// Requests still available in the trailing window.
    pub remaining: usize,
    /// Time until the oldest counted request ages out.
    pub reset_in: Duration,
}

/// Sliding-window admission gate.
///
/// Cheaply cloneable; all clones share the same window map.
#[derive(Clone)]
pub struct RateGate {
    inner: Arc<Inner>,
}

struct Inner {
    windows: DashMap<String, ClientWindow>,
    enabled: bool,
    capacity: usize,
    window: Duration,
    bypass: HashSet<String>,
}

impl RateGate {
    /// Create a gate allowing `capacity` requests per `window` per identity,
    /// with no bypass paths.
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self::with_bypass(capacity, window, std::iter::empty::<String>())
    }

    /// Create a gate with a fixed set of paths that skip admission entirely.
    pub fn with_bypass<I, S>(capacity: usize, window: Duration, bypass: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(Inner {
                windows: DashMap::new(),
                enabled: true,
                capacity,
                window,
                bypass: bypass.into_iter().map(Into::into).collect(),
            }),
        }
    }

    /// Build a gate from the `[rate_limit]` config section.
    ///
    /// With `enabled = false` every request is admitted and nothing is
    /// recorded.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                windows: DashMap::new(),
                enabled: config.enabled,
                capacity: config.requests_per_window,
                window: Duration::from_secs(config.window_secs),
                bypass: config.bypass_paths.iter().cloned().collect(),
            }),
        }
    }

    /// False if the gate admits everything.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Window capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// `true` if `path` is on the bypass list and must not be counted.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.inner.bypass.contains(path)
    }

    /// Count a request from `identity` at `now`, or reject it.
    ///
    /// Timestamps at or before `now - window` are pruned first; if the
    /// remaining count has reached capacity the request is rejected and
    /// nothing is recorded.
    pub fn admit(&self, identity: &str, now: Instant) -> Admission {
        let inner = &self.inner;
        if !inner.enabled {
            return Admission::Allowed {
                limit: inner.capacity,
                remaining: inner.capacity,
            };
        }
        let cutoff = now.checked_sub(inner.window);

        let mut window = match inner.windows.get_mut(identity) {
            Some(w) => w,
            None => inner.windows.entry(identity.to_string()).or_default(),
        };
        window.prune(cutoff);

        if window.len() >= inner.capacity {
            let retry_after = window
                .timestamps
                .front()
                .map(|oldest| (*oldest + inner.window).saturating_duration_since(now))
                .unwrap_or(inner.window);
            warn!(
                identity = identity,
                count = window.len(),
                limit = inner.capacity,
                "admission rejected"
            );
            return Admission::Rejected { retry_after };
        }

        window.timestamps.push_back(now);
        let remaining = inner.capacity - window.len();
        debug!(
            identity = identity,
            count = window.len(),
            limit = inner.capacity,
            "admission granted"
        );
        Admission::Allowed {
            limit: inner.capacity,
            remaining,
        }
    }

    /// [`admit`](Self::admit) at the current instant.
    pub fn check(&self, identity: &str) -> Admission {
        self.admit(identity, Instant::now())
    }

    /// Usage for `identity` as of `now`, or `None` if it has no window.
    pub fn usage(&self, identity: &str, now: Instant) -> Option<RateLimitInfo> {
        let cutoff = now.checked_sub(self.inner.window);
        let mut window = self.inner.windows.get_mut(identity)?;
        window.prune(cutoff);
        let reset_in = window
            .timestamps
            .front()
            .map(|oldest| (*oldest + self.inner.window).saturating_duration_since(now))
            .unwrap_or_default();
        Some(RateLimitInfo {
            used: window.len(),
            remaining: self.inner.capacity.saturating_sub(window.len()),
            reset_in,
        })
    }

    /// Forget every counted request for `identity`.
    pub fn reset(&self, identity: &str) {
        self.inner.windows.remove(identity);
        debug!(identity = identity, "admission window reset");
    }

    /// Prune every window and drop identities left empty.
    ///
    /// Returns how many identities were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.inner.window);
        let before = self.inner.windows.len();
        self.inner.windows.retain(|_, w| {
            w.prune(cutoff);
            !w.is_empty()
        });
        let removed = before.saturating_sub(self.inner.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.inner.windows.len(), "swept idle admission windows");
        }
        removed
    }

    /// Number of identities currently holding a window.
    pub fn tracked_identities(&self) -> usize {
        self.inner.windows.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    /// A zero interval is raised to [`MIN_SWEEP_INTERVAL`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let gate = self.clone();
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep(Instant::now());
            }
        })
    }
}

/// Round a retry hint up to whole seconds, never below one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
