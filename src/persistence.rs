//! Prediction persistence.
//!
//! The pipeline only ever writes through [`PersistenceSink`], and only from
//! a background task, so a slow or failing store never touches latency.
//! [`HistorySource`] is the read side consumed by [`crate::history`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::compute::DreamLabel;

/// Errors raised by a persistence backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// The backend could not be reached.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the record.
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// One stored prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Record id.
    pub id: Uuid,
    /// Predicted label.
    pub dream: DreamLabel,
    /// Confidence as a fraction in `[0, 1]`.
    pub confidence: f64,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Write side: store one prediction.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist `label` with `confidence` (a fraction in `[0, 1]`).
    async fn save(&self, label: DreamLabel, confidence: f64) -> Result<(), PersistenceError>;
}

/// Read side: fetch recent predictions, newest first.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Return at most `limit` records.
    async fn recent(&self, limit: usize) -> Result<Vec<PredictionRecord>, PersistenceError>;
}

/// Records kept by [`MemoryStore::default`].
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// In-process store used by the binary and by tests.
///
/// Holds at most `max_records` predictions; saving past that drops the
/// oldest.
#[derive(Clone)]
pub struct MemoryStore {
    records: Arc<RwLock<VecDeque<PredictionRecord>>>,
    max_records: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }
}

impl MemoryStore {
    /// Create an empty store holding [`DEFAULT_MAX_RECORDS`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store holding at most `max_records` (minimum 1).
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records: max_records.max(1),
        }
    }

    /// Maximum number of records kept.
    pub fn capacity(&self) -> usize {
        self.max_records
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copy of every record, oldest first.
    pub fn records(&self) -> Vec<PredictionRecord> {
        self.records.read().iter().cloned().collect()
    }
}

#[async_trait]
impl PersistenceSink for MemoryStore {
    async fn save(&self, label: DreamLabel, confidence: f64) -> Result<(), PersistenceError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(PersistenceError::Rejected(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        let mut records = self.records.write();
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(PredictionRecord {
            id: Uuid::new_v4(),
            dream: label,
            confidence,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl HistorySource for MemoryStore {
    async fn recent(&self, limit: usize) -> Result<Vec<PredictionRecord>, PersistenceError> {
        let records = self.records.read();
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}
