//! Prometheus metrics for the decoder core.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_stage_latency`, `inc_request`, …) are no-ops until then, so the
//! core runs unchanged in tests and embedders that never initialise metrics.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `decoder_requests_total` | Counter | `stage` |
//! | `decoder_admission_rejected_total` | Counter | — |
//! | `decoder_fallbacks_total` | Counter | `stage` |
//! | `decoder_background_tasks_total` | Counter | `task`, `outcome` |
//! | `decoder_provider_attempts_total` | Counter | `provider`, `outcome` |
//! | `decoder_stage_duration_seconds` | Histogram | `stage` |
//! | `decoder_offload_queue_depth` | Gauge | — |

use crate::DecoderError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// Every decoder metric, stored in one [`OnceLock`] and initialised together.
pub struct Metrics {
    /// Registry owning all descriptors.
    pub registry: Registry,
    /// Requests entering each pipeline stage.
    pub requests_total: CounterVec,
    /// Requests rejected by admission control.
    pub admission_rejected: IntCounter,
    /// Canned results substituted per stage.
    pub fallbacks_total: CounterVec,
    /// Finished background tasks by name and outcome.
    pub background_tasks: CounterVec,
    /// Image provider calls by provider and outcome.
    pub provider_attempts: CounterVec,
    /// Stage latency histogram.
    pub stage_duration: HistogramVec,
    /// Jobs waiting in the offload queue.
    pub offload_queue_depth: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> DecoderError {
    DecoderError::Other(format!("metrics init failed: {e}"))
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: &C) -> Result<(), DecoderError> {
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| DecoderError::Other(format!("metrics registration failed: {e}")))
}

fn build(prefix: &str) -> Result<Metrics, DecoderError> {
    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(format!("{prefix}_requests_total"), "Requests entering each stage"),
        &["stage"],
    )
    .map_err(init_err)?;
    register(&registry, &requests_total)?;

    let admission_rejected = IntCounter::new(
        format!("{prefix}_admission_rejected_total"),
        "Requests rejected by admission control",
    )
    .map_err(init_err)?;
    register(&registry, &admission_rejected)?;

    let fallbacks_total = CounterVec::new(
        Opts::new(format!("{prefix}_fallbacks_total"), "Fallback results served per stage"),
        &["stage"],
    )
    .map_err(init_err)?;
    register(&registry, &fallbacks_total)?;

    let background_tasks = CounterVec::new(
        Opts::new(
            format!("{prefix}_background_tasks_total"),
            "Finished background tasks by outcome",
        ),
        &["task", "outcome"],
    )
    .map_err(init_err)?;
    register(&registry, &background_tasks)?;

    let provider_attempts = CounterVec::new(
        Opts::new(
            format!("{prefix}_provider_attempts_total"),
            "Image provider calls by outcome",
        ),
        &["provider", "outcome"],
    )
    .map_err(init_err)?;
    register(&registry, &provider_attempts)?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}_stage_duration_seconds"),
            "Processing duration per stage",
        ),
        &["stage"],
    )
    .map_err(init_err)?;
    register(&registry, &stage_duration)?;

    let offload_queue_depth = IntGauge::new(
        format!("{prefix}_offload_queue_depth"),
        "Jobs waiting for an offload worker",
    )
    .map_err(init_err)?;
    register(&registry, &offload_queue_depth)?;

    Ok(Metrics {
        registry,
        requests_total,
        admission_rejected,
        fallbacks_total,
        background_tasks,
        provider_attempts,
        stage_duration,
        offload_queue_depth,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics in a private registry.
///
/// A second call is a no-op returning `Ok(())`.
///
/// # Errors
///
/// Returns [`DecoderError::Other`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), DecoderError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("decoder")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record the latency of one pipeline stage.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count a request entering `stage`.
pub fn inc_request(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[stage]) {
            c.inc();
        }
    }
}

/// Count an admission rejection.
pub fn inc_admission_rejected() {
    if let Some(m) = metrics() {
        m.admission_rejected.inc();
    }
}

/// Count a fallback result substituted at `stage`.
pub fn inc_fallback(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.fallbacks_total.get_metric_with_label_values(&[stage]) {
            c.inc();
        }
    }
}

/// Count a finished background task. `outcome` is `"ok"` or `"failed"`.
pub fn inc_background_task(task: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .background_tasks
            .get_metric_with_label_values(&[task, outcome])
        {
            c.inc();
        }
    }
}

/// Count one image provider call.
pub fn inc_provider_attempt(provider: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .provider_attempts
            .get_metric_with_label_values(&[provider, outcome])
        {
            c.inc();
        }
    }
}

/// Set the offload queue depth gauge.
pub fn set_offload_queue_depth(depth: i64) {
    if let Some(m) = metrics() {
        m.offload_queue_depth.set(depth);
    }
}

/// Gather all registered metric families. Empty before [`init_metrics`].
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string before [`init_metrics`] or if encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter snapshot used by the health endpoint.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MetricsSummary {
    /// Requests keyed by stage.
    pub requests_total: HashMap<String, u64>,
    /// Fallbacks keyed by stage.
    pub fallbacks_total: HashMap<String, u64>,
    /// Admission rejections.
    pub admission_rejected: u64,
}

fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map_or("unknown", |l| l.get_value())
}

fn counters_by_stage(vec: &CounterVec) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let value = metric.get_counter().get_value() as u64;
            out.insert(label(metric, "stage").to_string(), value);
        }
    }
    out
}

/// Current counter values. Zeroed before [`init_metrics`].
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        requests_total: counters_by_stage(&m.requests_total),
        fallbacks_total: counters_by_stage(&m.fallbacks_total),
        admission_rejected: m.admission_rejected.get(),
    }
}
