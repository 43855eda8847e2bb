//! The persisted rollup record and its freshness policy.
//!
//! One [`CacheRecord`] lives at a well-known key and is only ever replaced
//! whole. Concurrent writers race and the last one wins; the store's atomic
//! put guarantees the record is never a mix of two computations.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CacheError, StoreError};
use crate::storage::KeyValueStore;
use crate::types::{AggregateSet, CacheRecord};

/// Key the rollup record is stored under.
pub const AVERAGES_KEY: &str = "TemperatureAverages";

/// Maximum age of a cached record before it is recomputed.
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(60 * 60);

impl CacheRecord {
    /// Milliseconds elapsed between `last_updated` and `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_updated)
    }

    /// A record is fresh while its age is below `window`.
    ///
    /// A `last_updated` in the future (clock skew between writers) is treated
    /// as stale, otherwise a skewed record could be served indefinitely.
    pub fn is_fresh(&self, now_ms: i64, window: Duration) -> bool {
        let age = self.age_ms(now_ms);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        (0..window_ms).contains(&age)
    }
}

/// Read/write access to the single persisted [`CacheRecord`].
pub struct AggregationCache<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> AggregationCache<S> {
    pub fn new(store: S) -> Self {
        Self::with_key(store, AVERAGES_KEY)
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the cached record.
    ///
    /// A document that does not decode, or whose rollups have the wrong
    /// lengths, is logged and reported as absent so it gets recomputed.
    pub async fn load(&self) -> Result<Option<CacheRecord>, CacheError> {
        let value = match self.store.get(&self.key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("No cached averages at {}", self.key);
                return Ok(None);
            }
            Err(StoreError::Serialization(e)) => {
                warn!("Cached averages at {} are not JSON, ignoring: {}", self.key, e);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::Load(e)),
        };

        match serde_json::from_value::<CacheRecord>(value) {
            Ok(record) if record.averages.is_complete() => Ok(Some(record)),
            Ok(_) => {
                warn!("Cached averages at {} are incomplete, ignoring", self.key);
                Ok(None)
            }
            Err(e) => {
                warn!("Cached averages at {} do not decode, ignoring: {}", self.key, e);
                Ok(None)
            }
        }
    }

    /// Replace the cached record with `averages` stamped `last_updated` (epoch ms).
    pub async fn save(
        &self,
        averages: &AggregateSet,
        last_updated: i64,
    ) -> Result<CacheRecord, CacheError> {
        let record = CacheRecord {
            averages: averages.clone(),
            last_updated,
        };
        let value = serde_json::to_value(&record)?;

        self.store
            .put(&self.key, value)
            .await
            .map_err(CacheError::Persist)?;

        debug!("Persisted averages to {} at {}", self.key, last_updated);
        Ok(record)
    }
}
