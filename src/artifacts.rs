//! In-memory store for images produced by background image tasks.
//!
//! ## Usage
//!
//! ```no_run
//! use dream_decoder::artifacts::{ArtifactStore, GeneratedImage};
//! use dream_decoder::providers::Artifact;
//!
//! let store = ArtifactStore::new(1000);
//! store.insert("req-1", GeneratedImage::new(
//!     Artifact::Url("https://example.com/a.png".into()),
//!     "openai",
//!     "a calm lake",
//!     "Balanced sleep",
//! ));
//! assert!(store.get("req-1").is_some());
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::providers::Artifact;

/// Default number of images retained.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// One finished image together with how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedImage {
    /// The image itself.
    pub artifact: Artifact,
    /// Provider that produced it.
    pub provider: String,
    /// Prompt sent to the provider.
    pub prompt: String,
    /// Human-readable dream interpretation.
    pub interpretation: String,
    /// When the image was stored.
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    /// Build an image record stamped with the current time.
    pub fn new(
        artifact: Artifact,
        provider: impl Into<String>,
        prompt: impl Into<String>,
        interpretation: impl Into<String>,
    ) -> Self {
        Self {
            artifact,
            provider: provider.into(),
            prompt: prompt.into(),
            interpretation: interpretation.into(),
            created_at: Utc::now(),
        }
    }
}

/// Bounded map from request id to generated image.
///
/// When full, the oldest image is evicted before an insert. Inserts are
/// serialized so the store never exceeds `max_entries`; reads are not.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<DashMap<String, GeneratedImage>>,
    write_lock: Arc<Mutex<()>>,
    max_entries: usize,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ArtifactStore {
    /// Create a store holding at most `max_entries` images (0 = unbounded).
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            write_lock: Arc::new(Mutex::new(())),
            max_entries,
        }
    }

    /// Store the image for `request_id`, replacing any previous one.
    pub fn insert(&self, request_id: impl Into<String>, image: GeneratedImage) {
        let request_id = request_id.into();
        let _guard = self.write_lock.lock();
        while self.max_entries > 0
            && self.store.len() >= self.max_entries
            && !self.store.contains_key(&request_id)
        {
            // Collect the key first so no read guard is held during remove.
            let oldest = self
                .store
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.store.remove(&key);
                    debug!(request_id = %key, "evicted oldest image");
                }
                None => break,
            }
        }
        debug!(request_id = %request_id, provider = %image.provider, "image stored");
        self.store.insert(request_id, image);
    }

    /// Image for `request_id`, if the background task has finished.
    pub fn get(&self, request_id: &str) -> Option<GeneratedImage> {
        self.store.get(request_id).map(|e| e.value().clone())
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True if no image is stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
