//! Recent-dreams history with a short-lived cache.
//!
//! A read inside the TTL is served from memory. A miss reads the
//! [`HistorySource`] under a timeout; an empty, failing or slow source
//! yields the built-in sample dreams, which are cached like real data.
//! Refreshes are serialized so concurrent misses cause one source read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HistoryConfig;
use crate::persistence::{HistorySource, PredictionRecord};

/// One entry of the history listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Record id.
    pub id: String,
    /// Dream description or label.
    pub dream: String,
    /// Confidence in whole percent.
    pub confidence: u32,
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    /// Dream category.
    #[serde(rename = "type")]
    pub kind: String,
    /// Intensity banner text.
    pub intensity: String,
    /// Banner colour as a hex string.
    #[serde(rename = "intensityColor")]
    pub intensity_color: String,
}

/// Intensity banner and colour for a confidence fraction.
pub fn intensity_for(confidence: f64) -> (&'static str, &'static str) {
    if confidence >= 0.9 {
        ("EXTREME INTENSITY", "#ff4757")
    } else if confidence >= 0.8 {
        ("HIGH INTENSITY", "#ff6b6b")
    } else {
        ("MODERATE INTENSITY", "#4ecdc4")
    }
}

impl From<&PredictionRecord> for HistoryEntry {
    fn from(record: &PredictionRecord) -> Self {
        let (intensity, color) = intensity_for(record.confidence);
        Self {
            id: record.id.to_string(),
            dream: record.dream.as_str().to_string(),
            confidence: (record.confidence * 100.0).round() as u32,
            date: record.created_at.format("%Y-%m-%d").to_string(),
            kind: record.dream.as_str().to_string(),
            intensity: intensity.to_string(),
            intensity_color: color.to_string(),
        }
    }
}

fn sample(id: &str, dream: &str, confidence: u32, date: &str, kind: &str) -> HistoryEntry {
    let (intensity, color) = intensity_for(f64::from(confidence) / 100.0);
    HistoryEntry {
        id: id.to_string(),
        dream: dream.to_string(),
        confidence,
        date: date.to_string(),
        kind: kind.to_string(),
        intensity: intensity.to_string(),
        intensity_color: color.to_string(),
    }
}

/// Built-in history shown when the store has nothing to offer.
pub fn sample_dreams() -> Vec<HistoryEntry> {
    vec![
        sample(
            "1",
            "Exploration of an ancient library beneath the ocean. Strong alpha waves detected during REM phase.",
            87,
            "2024-02-03",
            "Water Dream",
        ),
        sample(
            "2",
            "Standard memory consolidation during deep sleep. Higher theta activity noted in prefrontal cortex.",
            73,
            "2024-02-02",
            "REM Stage",
        ),
        sample(
            "3",
            "Rapid pulse and beta wave spikes. Correlated with physiological stress response patterns.",
            92,
            "2024-02-01",
            "Nightmare",
        ),
    ]
}

struct CacheEntry {
    entries: Vec<HistoryEntry>,
    refreshed_at: Instant,
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that refreshed the cache.
    pub misses: u64,
}

/// TTL cache in front of a [`HistorySource`].
pub struct HistoryCache {
    source: Arc<dyn HistorySource>,
    ttl: Duration,
    source_timeout: Duration,
    limit: usize,
    state: Mutex<Option<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HistoryCache {
    /// Create a cache over `source`.
    pub fn new(
        source: Arc<dyn HistorySource>,
        ttl: Duration,
        source_timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            source,
            ttl,
            source_timeout,
            limit,
            state: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache sized from `[history]` config.
    pub fn from_config(source: Arc<dyn HistorySource>, config: &HistoryConfig) -> Self {
        Self::new(
            source,
            Duration::from_secs(config.ttl_secs),
            Duration::from_millis(config.source_timeout_ms),
            config.limit,
        )
    }

    /// Current history, newest first. Never fails.
    pub async fn get(&self) -> Vec<HistoryEntry> {
        // Held across the refresh; a second caller waits and sees fresh data.
        let mut state = self.state.lock().await;

        if let Some(entry) = state.as_ref() {
            if entry.refreshed_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.entries.clone();
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let entries = self.fetch().await;
        *state = Some(CacheEntry {
            entries: entries.clone(),
            refreshed_at: Instant::now(),
        });
        entries
    }

    async fn fetch(&self) -> Vec<HistoryEntry> {
        match tokio::time::timeout(self.source_timeout, self.source.recent(self.limit)).await {
            Ok(Ok(records)) if !records.is_empty() => {
                debug!(count = records.len(), "history refreshed from store");
                records.iter().map(HistoryEntry::from).collect()
            }
            Ok(Ok(_)) => {
                debug!("history store empty, serving samples");
                sample_dreams()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "history store failed, serving samples");
                sample_dreams()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.source_timeout.as_millis() as u64,
                    "history store timed out, serving samples"
                );
                sample_dreams()
            }
        }
    }

    /// Drop the cached entry so the next read refreshes.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// Hit and miss counts since creation.
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::DreamLabel;
    use crate::persistence::{MemoryStore, PersistenceError, PersistenceSink};
    use async_trait::async_trait;

    struct CountingSource {
        inner: MemoryStore,
        calls: AtomicU64,
        delay: Duration,
    }

    impl CountingSource {
        fn new(inner: MemoryStore, delay: Duration) -> Self {
            Self {
                inner,
                calls: AtomicU64::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl HistorySource for CountingSource {
        async fn recent(&self, limit: usize) -> Result<Vec<PredictionRecord>, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.recent(limit).await
        }
    }

    struct FailingSource;

    #[async_trait]
    impl HistorySource for FailingSource {
        async fn recent(&self, _limit: usize) -> Result<Vec<PredictionRecord>, PersistenceError> {
            Err(PersistenceError::Unavailable("connection refused".into()))
        }
    }

    fn cache_over(source: Arc<dyn HistorySource>) -> HistoryCache {
        HistoryCache::new(source, Duration::from_secs(30), Duration::from_secs(2), 3)
    }

    #[test]
    fn test_intensity_thresholds() {
        assert_eq!(intensity_for(0.95).0, "EXTREME INTENSITY");
        assert_eq!(intensity_for(0.9).1, "#ff4757");
        assert_eq!(intensity_for(0.85).0, "HIGH INTENSITY");
        assert_eq!(intensity_for(0.5).1, "#4ecdc4");
    }

    #[test]
    fn test_entry_serializes_camel_case_fields() {
        let json = serde_json::to_value(&sample_dreams()[0]).unwrap();
        assert_eq!(json["type"], "Water Dream");
        assert_eq!(json["intensityColor"], "#ff6b6b");
        assert_eq!(json["confidence"], 87);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_records_are_mapped_newest_first() {
        let store = MemoryStore::new();
        store.save(DreamLabel::Nightmare, 0.92).await.unwrap();
        store.save(DreamLabel::LucidDream, 0.5).await.unwrap();
        let cache = cache_over(Arc::new(store));

        let entries = cache.get().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dream, "Lucid Dream");
        assert_eq!(entries[1].confidence, 92);
        assert_eq!(entries[1].intensity, "EXTREME INTENSITY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_inside_ttl_does_not_touch_source() {
        let store = MemoryStore::new();
        store.save(DreamLabel::MemoryRecall, 0.7).await.unwrap();
        let source = Arc::new(CountingSource::new(store, Duration::ZERO));
        let cache = cache_over(source.clone());

        cache.get().await;
        tokio::time::advance(Duration::from_secs(29)).await;
        cache.get().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats(), HistoryStats { hits: 1, misses: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_store_serves_samples() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        assert_eq!(cache.get().await, sample_dreams());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_store_serves_samples() {
        let cache = cache_over(Arc::new(FailingSource));
        assert_eq!(cache.get().await, sample_dreams());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_to_samples() {
        let store = MemoryStore::new();
        store.save(DreamLabel::Nightmare, 0.6).await.unwrap();
        let source = Arc::new(CountingSource::new(store, Duration::from_secs(10)));
        let cache = cache_over(source);

        let start = Instant::now();
        let entries = cache.get().await;
        assert_eq!(entries, sample_dreams());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_read_source_once() {
        let store = MemoryStore::new();
        store.save(DreamLabel::LucidDream, 0.8).await.unwrap();
        let source = Arc::new(CountingSource::new(store, Duration::from_millis(500)));
        let cache = Arc::new(cache_over(source.clone()));

        let a = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get().await }
        });
        let b = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a, b);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(CountingSource::new(MemoryStore::new(), Duration::ZERO));
        let cache = cache_over(source.clone());
        cache.get().await;
        cache.invalidate().await;
        cache.get().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
