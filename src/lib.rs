//! # dream-decoder
//!
//! Asynchronous request-processing core for an EEG dream decoding backend.
//!
//! ## Architecture
//!
//! One inbound prediction flows strictly top to bottom:
//! ```text
//! RateGate ─admit─▶ Parsing(offload) ─▶ Computing(offload) ─▶ Responding
//!                                                              │
//!                                   BackgroundDispatch ◀───────┘
//!                                   ├─ PersistenceSink::save
//!                                   └─ ProviderChain::resolve (optional)
//! ```
//!
//! - [`admission`] — sliding-window admission control keyed by client address.
//! - [`offload`] — bounded worker pool for CPU-bound signal processing.
//! - [`background`] — fire-and-forget tasks whose failures never reach the caller.
//! - [`providers`] — ordered image-provider fallback chain with per-call timeouts.
//! - [`pipeline`] — per-request orchestration of the above.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod admission;
pub mod artifacts;
pub mod background;
pub mod compute;
pub mod config;
pub mod history;
pub mod metrics;
pub mod offload;
pub mod persistence;
pub mod pipeline;
pub mod providers;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use admission::{Admission, RateGate};
pub use background::BackgroundTaskRunner;
pub use compute::{BandPowers, ComputeFunction, ComputeResult, DreamLabel, SignalClassifier};
pub use offload::{OffloadHandle, OffloadScheduler};
pub use persistence::{MemoryStore, PersistenceSink};
pub use pipeline::{PredictResponse, RequestPipeline};
pub use providers::{Artifact, ImageProvider, ProviderChain};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DecoderError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), DecoderError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DecoderError::Other(format!("tracing init failed: {e}")))
}

/// Top-level decoder errors.
///
/// Module-level error enums convert into this type via `#[from]`. Of all
/// variants only [`DecoderError::AdmissionRejected`] is ever shown to an HTTP
/// caller; the rest are recovered inside the core and only logged.
#[derive(Error, Debug)]
pub enum DecoderError {
    /// The client exceeded its admission quota for the current window.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    AdmissionRejected {
        /// Whole seconds until the oldest counted request ages out.
        retry_after_secs: u64,
    },

    /// The offload pool could not run a job.
    #[error(transparent)]
    Offload(#[from] offload::OffloadError),

    /// Signal parsing or classification failed.
    #[error(transparent)]
    Compute(#[from] compute::ComputeError),

    /// The persistence sink refused or failed a write.
    #[error(transparent)]
    Persistence(#[from] persistence::PersistenceError),

    /// An image provider call failed.
    #[error(transparent)]
    Provider(#[from] providers::ProviderError),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Socket or file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<config::validation::ConfigError> for DecoderError {
    fn from(e: config::validation::ConfigError) -> Self {
        DecoderError::ConfigError(e.to_string())
    }
}

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
