//! Integration tests for `RequestPipeline`
//!
//! Exercises admission, offload and background dispatch together under
//! concurrent load, without the HTTP layer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use dream_decoder::config::DecoderConfig;
use dream_decoder::persistence::PersistenceError;
use dream_decoder::{
    BackgroundTaskRunner, DecoderError, DreamLabel, MemoryStore, OffloadScheduler,
    PersistenceSink, ProviderChain, RateGate, RequestPipeline, SignalClassifier,
};

fn pipeline(capacity: usize, sink: Arc<dyn PersistenceSink>) -> RequestPipeline {
    RequestPipeline::new(
        RateGate::new(capacity, Duration::from_secs(60)),
        OffloadScheduler::new(2),
        BackgroundTaskRunner::default(),
        Arc::new(SignalClassifier::new()),
        sink,
        Arc::new(ProviderChain::placeholder_only()),
    )
}

fn upload(seed: usize) -> Vec<u8> {
    (0..256)
        .map(|i| format!("{:.3}", ((i + seed) as f64 * 0.07).cos() * 25.0))
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

/// Fails every write, counting attempts.
struct BrokenStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl PersistenceSink for BrokenStore {
    async fn save(&self, _: DreamLabel, _: f64) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PersistenceError::Unavailable("database offline".into()))
    }
}

#[tokio::test]
async fn test_concurrent_requests_never_exceed_capacity() {
    let p = pipeline(10, Arc::new(MemoryStore::new()));

    let results = join_all((0..25).map(|i| {
        let p = p.clone();
        async move { p.predict("192.0.2.1", upload(i)).await }
    }))
    .await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(DecoderError::AdmissionRejected { .. })))
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(rejected, 15);
}

#[tokio::test]
async fn test_identities_have_independent_windows() {
    let p = pipeline(1, Arc::new(MemoryStore::new()));

    assert!(p.predict("192.0.2.1", upload(0)).await.is_ok());
    assert!(p.predict("192.0.2.2", upload(1)).await.is_ok());
    assert!(p.predict("192.0.2.1", upload(2)).await.is_err());
    assert_eq!(p.gate().tracked_identities(), 2);
}

#[tokio::test]
async fn test_every_admitted_request_is_persisted() {
    let store = MemoryStore::new();
    let p = pipeline(50, Arc::new(store.clone()));

    let outcomes = join_all((0..20).map(|i| {
        let p = p.clone();
        async move { p.predict(&format!("10.0.0.{i}"), upload(i)).await }
    }))
    .await;
    assert!(outcomes.iter().all(Result::is_ok));

    assert!(p.background().wait_idle(Duration::from_secs(5)).await);
    assert_eq!(store.len(), 20);
    assert!(store
        .records()
        .iter()
        .all(|r| (0.0..=1.0).contains(&r.confidence)));
}

#[tokio::test]
async fn test_persistence_failures_are_dead_lettered_not_returned() {
    let sink = Arc::new(BrokenStore {
        attempts: AtomicUsize::new(0),
    });
    let p = pipeline(10, sink.clone());

    for i in 0..3 {
        let outcome = p.predict("c", upload(i)).await.expect("admitted");
        assert!(!outcome.response.degraded);
    }

    assert!(p.background().wait_idle(Duration::from_secs(2)).await);
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    let letters = p.background().dead_letters();
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.task.name == "persist_prediction"));
    assert!(letters[0].error.contains("database offline"));
}

#[tokio::test]
async fn test_disabled_rate_limit_admits_everything() {
    let mut config = DecoderConfig::default();
    config.rate_limit.enabled = false;
    config.rate_limit.requests_per_window = 1;
    let p = RequestPipeline::from_config(&config, Arc::new(MemoryStore::new()));

    for i in 0..5 {
        assert!(p.predict("c", upload(i)).await.is_ok());
    }
    assert_eq!(p.gate().tracked_identities(), 0);
}

#[tokio::test]
async fn test_shut_down_pool_degrades_instead_of_failing() {
    let p = pipeline(10, Arc::new(MemoryStore::new()));
    p.scheduler().shutdown();

    let outcome = p.predict("c", upload(0)).await.expect("admitted");
    assert!(outcome.response.degraded);
    assert_eq!(outcome.response.dream, DreamLabel::LucidDream);
    assert_eq!(outcome.response.confidence, 85.7);
}
