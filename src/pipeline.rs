//! # Stage: Request Pipeline
//!
//! ## Responsibility
//! Drive one prediction through
//! `Admitted → Parsing → Computing → Responding → BackgroundDispatch → Done`.
//!
//! ## Guarantees
//! - Ordered: parsing finishes before computing, computing before the
//!   response is built, the response is built before any background task
//! - Degrading: a parse failure substitutes a synthetic signal, a compute
//!   failure substitutes the canned result; neither reaches the caller
//! - Non-blocking: persistence and image generation never delay the response
//! - Only admission rejection is surfaced as an error
//!
//! ## NOT Responsible For
//! - HTTP framing and headers (see `web_api`)
//! - The classification itself (see [`crate::compute`])

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::admission::{retry_after_secs, Admission, RateGate};
use crate::artifacts::{ArtifactStore, GeneratedImage};
use crate::background::BackgroundTaskRunner;
use crate::compute::{
    self, percent, BandPowers, ComputeFunction, ComputeResult, DreamLabel, LabelProbabilities,
    SignalClassifier, SYNTHETIC_SIGNAL_LEN,
};
use crate::config::DecoderConfig;
use crate::metrics;
use crate::offload::OffloadScheduler;
use crate::persistence::PersistenceSink;
use crate::providers::{DreamPrompt, ProviderChain};
use crate::DecoderError;

/// Where a request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Passed admission control.
    Admitted,
    /// Turning the upload into a signal.
    Parsing,
    /// Classifying the signal.
    Computing,
    /// Building the response payload.
    Responding,
    /// Launching persistence and image tasks.
    BackgroundDispatch,
    /// Response returned.
    Done,
}

impl PipelineStage {
    /// Stage name used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Admitted => "admitted",
            PipelineStage::Parsing => "parsing",
            PipelineStage::Computing => "computing",
            PipelineStage::Responding => "responding",
            PipelineStage::BackgroundDispatch => "background_dispatch",
            PipelineStage::Done => "done",
        }
    }
}

/// Prediction payload returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Server-assigned id for fetching the generated image later.
    pub request_id: String,
    /// Predicted label.
    pub dream: DreamLabel,
    /// Confidence in percent, two decimals.
    pub confidence: f64,
    /// First samples of the classified signal.
    pub signal: Vec<f64>,
    /// Band features.
    pub bands: BandPowers,
    /// Per-label probability in percent, two decimals.
    pub probabilities: LabelProbabilities,
    /// True if an image task was spawned for this request.
    pub dream_image_generating: bool,
    /// True if any stage served fallback data.
    pub degraded: bool,
}

impl PredictResponse {
    fn from_result(request_id: String, result: ComputeResult, degraded: bool, image: bool) -> Self {
        Self {
            request_id,
            dream: result.label,
            confidence: percent(result.confidence),
            signal: result.signal_prefix,
            bands: result.bands,
            probabilities: result.probabilities.as_percentages(),
            dream_image_generating: image,
            degraded,
        }
    }
}

/// Quota state after a successful admission, for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionInfo {
    /// Window capacity.
    pub limit: usize,
    /// Admissions left in the current window.
    pub remaining: usize,
}

/// Everything a caller needs after a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// Server-assigned prediction id, also inside `response`.
    pub request_id: String,
    /// Payload for the client.
    pub response: PredictResponse,
    /// Present when the request went through [`RequestPipeline::predict`].
    pub admission: Option<AdmissionInfo>,
}

/// Input of a direct image generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamImageRequest {
    /// Label text, e.g. "Lucid Dream".
    pub dream_type: String,
    /// Confidence in percent.
    pub confidence: f64,
    /// Band features.
    pub bands: BandPowers,
    /// Optional per-label probabilities; accepted and ignored.
    #[serde(default)]
    pub probabilities: Option<serde_json::Value>,
}

/// Per-request orchestrator. Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct RequestPipeline {
    gate: RateGate,
    scheduler: OffloadScheduler,
    background: BackgroundTaskRunner,
    compute: Arc<dyn ComputeFunction>,
    sink: Arc<dyn PersistenceSink>,
    providers: Arc<ProviderChain>,
    artifacts: ArtifactStore,
    generate_image: bool,
}

impl RequestPipeline {
    /// Assemble a pipeline from its parts. Image generation after a
    /// prediction is off; see [`RequestPipeline::with_image_generation`].
    pub fn new(
        gate: RateGate,
        scheduler: OffloadScheduler,
        background: BackgroundTaskRunner,
        compute: Arc<dyn ComputeFunction>,
        sink: Arc<dyn PersistenceSink>,
        providers: Arc<ProviderChain>,
    ) -> Self {
        Self {
            gate,
            scheduler,
            background,
            compute,
            sink,
            providers,
            artifacts: ArtifactStore::default(),
            generate_image: false,
        }
    }

    /// Build every component from `config` around `sink`, using the
    /// default [`SignalClassifier`]. Must run inside a Tokio runtime.
    pub fn from_config(config: &DecoderConfig, sink: Arc<dyn PersistenceSink>) -> Self {
        Self::new(
            RateGate::from_config(&config.rate_limit),
            OffloadScheduler::new(config.offload.workers),
            BackgroundTaskRunner::new(config.background.dead_letter_capacity),
            Arc::new(SignalClassifier::new()),
            sink,
            Arc::new(ProviderChain::from_config(&config.providers)),
        )
        .with_image_generation(config.background.generate_image_on_predict)
    }

    /// Spawn an image task after each prediction when `enabled`.
    pub fn with_image_generation(mut self, enabled: bool) -> Self {
        self.generate_image = enabled;
        self
    }

    /// Use `artifacts` for generated images.
    pub fn with_artifact_store(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Admission gate.
    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    /// Offload pool.
    pub fn scheduler(&self) -> &OffloadScheduler {
        &self.scheduler
    }

    /// Background runner.
    pub fn background(&self) -> &BackgroundTaskRunner {
        &self.background
    }

    /// Image provider chain.
    pub fn providers(&self) -> &ProviderChain {
        &self.providers
    }

    /// Generated images by request id.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Admit `identity`, then process `raw`.
    ///
    /// # Errors
    ///
    /// [`DecoderError::AdmissionRejected`] if `identity` is over quota.
    /// Nothing else fails.
    pub async fn predict(&self, identity: &str, raw: Vec<u8>) -> Result<PipelineOutcome, DecoderError> {
        match self.gate.admit(identity, Instant::now()) {
            Admission::Rejected { retry_after } => {
                metrics::inc_admission_rejected();
                let retry_after_secs = retry_after_secs(retry_after);
                info!(identity, retry_after_secs, "prediction rejected by admission");
                Err(DecoderError::AdmissionRejected { retry_after_secs })
            }
            Admission::Allowed { limit, remaining } => {
                let mut outcome = self.run(Some(identity), None, raw).await;
                outcome.admission = Some(AdmissionInfo { limit, remaining });
                Ok(outcome)
            }
        }
    }

    /// Run an already admitted request. Never fails.
    ///
    /// The prediction id in the outcome is always minted here, so it can key
    /// the artifact store without trusting anything the client sent.
    pub async fn process(&self, raw: Vec<u8>) -> PipelineOutcome {
        self.run(None, None, raw).await
    }

    /// [`RequestPipeline::process`] with the admitted client's identity and
    /// its correlation id attached to the request span.
    pub async fn process_from(
        &self,
        identity: &str,
        correlation_id: &str,
        raw: Vec<u8>,
    ) -> PipelineOutcome {
        self.run(Some(identity), Some(correlation_id), raw).await
    }

    async fn run(
        &self,
        identity: Option<&str>,
        correlation_id: Option<&str>,
        raw: Vec<u8>,
    ) -> PipelineOutcome {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "pipeline.predict",
            request_id = %request_id,
            correlation_id = correlation_id.unwrap_or("-"),
            identity = identity.unwrap_or("-"),
            bytes = raw.len(),
            duration_ms = field::Empty,
            outcome = field::Empty,
        );
        self.process_inner(request_id, raw).instrument(span).await
    }

    async fn process_inner(&self, request_id: String, raw: Vec<u8>) -> PipelineOutcome {
        let start = Instant::now();
        let mut degraded = false;

        // ── Parsing ──────────────────────────────────────────────────
        let stage_start = Instant::now();
        metrics::inc_request(PipelineStage::Parsing.as_str());
        let signal = match self
            .scheduler
            .submit("parse", move || compute::parse_signal(&raw))
            .await
        {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "parse failed, substituting synthetic signal");
                metrics::inc_fallback(PipelineStage::Parsing.as_str());
                degraded = true;
                compute::synthetic_signal(SYNTHETIC_SIGNAL_LEN)
            }
        };
        metrics::record_stage_latency(PipelineStage::Parsing.as_str(), stage_start.elapsed());

        // ── Computing ────────────────────────────────────────────────
        let stage_start = Instant::now();
        metrics::inc_request(PipelineStage::Computing.as_str());
        let classifier = Arc::clone(&self.compute);
        let result = match self
            .scheduler
            .submit("compute", move || {
                classifier
                    .compute(&signal)
                    .map(|c| ComputeResult::new(c, &signal))
            })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "compute failed, substituting default result");
                metrics::inc_fallback(PipelineStage::Computing.as_str());
                degraded = true;
                ComputeResult::fallback()
            }
        };
        metrics::record_stage_latency(PipelineStage::Computing.as_str(), stage_start.elapsed());

        // ── Responding ───────────────────────────────────────────────
        let label = result.label;
        let confidence = result.confidence;
        let bands = result.bands;
        let response =
            PredictResponse::from_result(request_id.clone(), result, degraded, self.generate_image);

        // ── BackgroundDispatch ───────────────────────────────────────
        let sink = Arc::clone(&self.sink);
        self.background.spawn("persist_prediction", async move {
            sink.save(label, confidence).await
        });

        if self.generate_image {
            let providers = Arc::clone(&self.providers);
            let artifacts = self.artifacts.clone();
            let id = request_id.clone();
            let confidence_pct = percent(confidence);
            self.background.spawn("dream_image", async move {
                let prompt = DreamPrompt::build(label.as_str(), confidence_pct, &bands);
                let resolved = providers.resolve(&prompt.prompt).await;
                artifacts.insert(
                    id,
                    GeneratedImage::new(
                        resolved.artifact,
                        resolved.provider,
                        prompt.prompt,
                        prompt.interpretation,
                    ),
                );
                Ok::<(), Infallible>(())
            });
        }

        let elapsed = start.elapsed();
        Span::current().record("duration_ms", elapsed.as_millis() as u64);
        Span::current().record("outcome", if degraded { "degraded" } else { "ok" });
        info!(dream = %label, degraded, "prediction served");

        PipelineOutcome {
            request_id,
            response,
            admission: None,
        }
    }

    /// Build a prompt from `request` and resolve it through the provider
    /// chain, waiting for the result.
    pub async fn generate_image(&self, request: &DreamImageRequest) -> GeneratedImage {
        let prompt = DreamPrompt::build(&request.dream_type, request.confidence, &request.bands);
        let resolved = self.providers.resolve(&prompt.prompt).await;
        GeneratedImage::new(
            resolved.artifact,
            resolved.provider,
            prompt.prompt,
            prompt.interpretation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Classification, ComputeError};
    use crate::persistence::{MemoryStore, PersistenceError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NeverReturns;

    #[async_trait]
    impl PersistenceSink for NeverReturns {
        async fn save(&self, _: DreamLabel, _: f64) -> Result<(), PersistenceError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    struct AlwaysFails;

    impl ComputeFunction for AlwaysFails {
        fn compute(&self, _: &[f64]) -> Result<Classification, ComputeError> {
            Err(ComputeError::Failed("model missing".into()))
        }
    }

    struct Panics;

    impl ComputeFunction for Panics {
        #[allow(clippy::panic)]
        fn compute(&self, _: &[f64]) -> Result<Classification, ComputeError> {
            panic!("model crashed")
        }
    }

    fn pipeline(
        capacity: usize,
        compute: Arc<dyn ComputeFunction>,
        sink: Arc<dyn PersistenceSink>,
    ) -> RequestPipeline {
        RequestPipeline::new(
            RateGate::new(capacity, Duration::from_secs(60)),
            OffloadScheduler::new(2),
            BackgroundTaskRunner::default(),
            compute,
            sink,
            Arc::new(ProviderChain::placeholder_only()),
        )
    }

    fn csv(n: usize) -> Vec<u8> {
        (0..n)
            .map(|i| format!("{:.3}", (i as f64 * 0.1).sin()))
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }

    #[tokio::test]
    async fn test_valid_upload_is_classified_and_persisted() {
        let store = MemoryStore::new();
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(store.clone()));

        let outcome = p.predict("10.0.0.1", csv(300)).await.unwrap();
        assert!(!outcome.response.degraded);
        assert_eq!(outcome.response.signal.len(), 200);
        assert_eq!(outcome.admission, Some(AdmissionInfo { limit: 10, remaining: 9 }));

        assert!(p.background().wait_idle(Duration::from_secs(2)).await);
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].dream, outcome.response.dream);
    }

    #[tokio::test]
    async fn test_unparseable_upload_uses_synthetic_signal() {
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(MemoryStore::new()));
        let outcome = p.process(b"not,a,number".to_vec()).await;
        assert!(outcome.response.degraded);
        assert_eq!(
            outcome.response.signal,
            compute::synthetic_signal(SYNTHETIC_SIGNAL_LEN)[..200].to_vec()
        );
    }

    #[tokio::test]
    async fn test_compute_failure_serves_default_result() {
        let p = pipeline(10, Arc::new(AlwaysFails), Arc::new(MemoryStore::new()));
        let r = p.process(csv(50)).await.response;
        assert!(r.degraded);
        assert_eq!(r.dream, DreamLabel::LucidDream);
        assert_eq!(r.confidence, 85.7);
        assert_eq!(r.bands, BandPowers::DEFAULT_RESULT);
        assert_eq!(r.probabilities.to_array(), [85.7, 8.3, 4.2, 1.8]);
    }

    #[tokio::test]
    async fn test_compute_panic_serves_default_result() {
        let p = pipeline(10, Arc::new(Panics), Arc::new(MemoryStore::new()));
        let r = p.process(csv(50)).await.response;
        assert!(r.degraded);
        assert_eq!(r.confidence, 85.7);
    }

    #[tokio::test]
    async fn test_hanging_sink_does_not_delay_response() {
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(NeverReturns));
        let outcome = tokio::time::timeout(Duration::from_secs(2), p.predict("c", csv(100)))
            .await
            .expect("response must not wait for persistence");
        assert!(outcome.is_ok());
        assert_eq!(p.background().stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_over_quota_is_rejected_without_processing() {
        let store = MemoryStore::new();
        let p = pipeline(1, Arc::new(SignalClassifier), Arc::new(store.clone()));
        p.predict("c", csv(10)).await.unwrap();

        match p.predict("c", csv(10)).await {
            Err(DecoderError::AdmissionRejected { retry_after_secs }) => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(p.scheduler().completed(), 2);
    }

    #[tokio::test]
    async fn test_image_task_stores_placeholder_artifact() {
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(MemoryStore::new()))
            .with_image_generation(true);
        let outcome = p.predict("c", csv(100)).await.unwrap();
        assert!(outcome.response.dream_image_generating);

        assert!(p.background().wait_idle(Duration::from_secs(2)).await);
        let image = p.artifacts().get(&outcome.request_id).unwrap();
        assert_eq!(image.provider, "demo");
        assert!(image.prompt.contains("digital art"));
    }

    #[tokio::test]
    async fn test_shared_correlation_id_keeps_images_apart() {
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(MemoryStore::new()))
            .with_image_generation(true);
        let first = p.process_from("a", "same-id", csv(100)).await;
        let second = p.process_from("b", "same-id", b"garbage".to_vec()).await;

        assert_ne!(first.request_id, second.request_id);
        assert_ne!(first.request_id, "same-id");
        assert!(p.background().wait_idle(Duration::from_secs(2)).await);
        assert!(p.artifacts().get(&first.request_id).is_some());
        assert!(p.artifacts().get(&second.request_id).is_some());
        assert_eq!(p.artifacts().len(), 2);
        assert!(p.artifacts().get("same-id").is_none());
    }

    #[tokio::test]
    async fn test_generate_image_for_default_analysis() {
        let p = pipeline(10, Arc::new(SignalClassifier), Arc::new(MemoryStore::new()));
        let image = p
            .generate_image(&DreamImageRequest {
                dream_type: "Lucid Dream".into(),
                confidence: 85.7,
                bands: BandPowers::DEFAULT_RESULT,
                probabilities: None,
            })
            .await;
        assert_eq!(image.provider, "demo");
        assert!(image.interpretation.contains("Lucid Dream"));
    }

    #[test]
    fn test_response_serializes_label_names() {
        let r = PredictResponse::from_result("id".into(), ComputeResult::fallback(), true, false);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["dream"], "Lucid Dream");
        assert_eq!(json["probabilities"]["Nightmare"], 8.3);
    }
}
