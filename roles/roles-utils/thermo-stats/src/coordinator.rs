//! Read-through orchestration of the rollup cache.
//!
//! Each call walks the same states:
//!
//! 1. load the cached record,
//! 2. serve it if it is younger than the stale window,
//! 3. otherwise fetch the full reading history,
//! 4. recompute the hourly, weekly and monthly rollups,
//! 5. persist them stamped with the current time,
//! 6. return the fresh rollups.
//!
//! A failed fetch fails the call and never falls back to stale data. A failed
//! persist is best effort: the fresh rollups are still returned, with the
//! error attached as a warning. Running out of time while persisting counts as
//! a failed persist; cancellation during persist still aborts the call. Callers that both see a stale record will both
//! recompute and both write; the last writer wins.

use chrono::{FixedOffset, Offset, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucketing::compute_aggregates;
use crate::cache::{AggregationCache, AVERAGES_KEY, DEFAULT_STALE_WINDOW};
use crate::clock::Clock;
use crate::error::{AggregateError, CacheError, Stage};
use crate::storage::{KeyValueStore, ReadingSource};
use crate::types::AggregateSet;

/// Tunables for [`AggregateCoordinator`].
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    /// Maximum cache age before recomputation
    pub stale_window: Duration,
    /// Fixed zone the sensor writes its local timestamps in
    pub utc_offset: FixedOffset,
    /// Upper bound on one [`AggregateCoordinator::get_aggregates`] call
    pub request_timeout: Option<Duration>,
    /// Key the rollup record is persisted under
    pub averages_key: String,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            stale_window: DEFAULT_STALE_WINDOW,
            utc_offset: Utc.fix(),
            request_timeout: None,
            averages_key: AVERAGES_KEY.to_string(),
        }
    }
}

/// Where the returned rollups came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cached,
    Recomputed,
}

#[derive(Debug)]
pub struct AggregateOutcome {
    pub averages: AggregateSet,
    pub origin: Origin,
    /// Epoch milliseconds the rollups were computed at
    pub last_updated: i64,
    /// Set when fresh rollups could not be written back
    pub persist_warning: Option<CacheError>,
}

/// Deadline and cancellation applied at every I/O point of one call.
struct IoGuard<'a> {
    deadline: Option<Instant>,
    cancel: Option<&'a CancellationToken>,
}

impl IoGuard<'_> {
    async fn run<T, F>(&self, stage: Stage, io: F) -> Result<T, AggregateError>
    where
        F: Future<Output = T>,
    {
        if self.cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(AggregateError::Cancelled { stage });
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, io)
                    .await
                    .map_err(|_| AggregateError::TimedOut { stage }),
                None => Ok(io.await),
            }
        };

        match self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(AggregateError::Cancelled { stage }),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }
}

/// Serves rollups from the cache, recomputing them when stale.
pub struct AggregateCoordinator {
    source: Arc<dyn ReadingSource>,
    cache: AggregationCache<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    settings: AggregationSettings,
}

impl AggregateCoordinator {
    pub fn new(
        source: Arc<dyn ReadingSource>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: AggregationSettings,
    ) -> Self {
        let cache = AggregationCache::with_key(store, settings.averages_key.clone());
        Self {
            source,
            cache,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    /// Return rollups, bounded by the configured request timeout.
    pub async fn get_aggregates(&self) -> Result<AggregateOutcome, AggregateError> {
        let guard = IoGuard {
            deadline: self.deadline(),
            cancel: None,
        };
        self.run(&guard).await
    }

    /// Like [`Self::get_aggregates`], also aborting as soon as `cancel` fires.
    ///
    /// Once cancellation is observed nothing further is written.
    pub async fn get_aggregates_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AggregateOutcome, AggregateError> {
        let guard = IoGuard {
            deadline: self.deadline(),
            cancel: Some(cancel),
        };
        self.run(&guard).await
    }

    fn deadline(&self) -> Option<Instant> {
        self.settings
            .request_timeout
            .map(|limit| Instant::now() + limit)
    }

    async fn run(&self, guard: &IoGuard<'_>) -> Result<AggregateOutcome, AggregateError> {
        let cached = guard
            .run(Stage::CacheLoad, self.cache.load())
            .await?
            .map_err(AggregateError::CacheUnavailable)?;

        let checked_at = self.clock.now().timestamp_millis();
        if let Some(record) = cached {
            if record.is_fresh(checked_at, self.settings.stale_window) {
                debug!(
                    "Serving cached averages ({}s old)",
                    record.age_ms(checked_at) / 1000
                );
                return Ok(AggregateOutcome {
                    averages: record.averages,
                    origin: Origin::Cached,
                    last_updated: record.last_updated,
                    persist_warning: None,
                });
            }
            info!(
                "Cached averages are stale ({}s old), recomputing",
                record.age_ms(checked_at) / 1000
            );
        } else {
            info!("No cached averages, computing");
        }

        let readings = guard
            .run(Stage::FetchReadings, self.source.fetch_all())
            .await?
            .map_err(|e| AggregateError::SourceUnavailable(e.to_string()))?;
        if readings.is_empty() {
            return Err(AggregateError::SourceUnavailable(
                "no readings stored".to_string(),
            ));
        }

        let computed_at = self.clock.now();
        let local_now = computed_at
            .with_timezone(&self.settings.utc_offset)
            .naive_local();
        let averages = compute_aggregates(readings.values(), local_now);
        let last_updated = computed_at.timestamp_millis();

        info!(
            "Recomputed averages from {} readings at {}",
            readings.len(),
            local_now
        );

        let persist_warning = match guard
            .run(Stage::CachePersist, self.cache.save(&averages, last_updated))
            .await
        {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e),
            Err(AggregateError::TimedOut { .. }) => Some(CacheError::PersistTimedOut),
            Err(e) => return Err(e),
        };
        if let Some(e) = &persist_warning {
            warn!("Serving fresh averages without caching them: {}", e);
        }

        Ok(AggregateOutcome {
            averages,
            origin: Origin::Recomputed,
            last_updated,
            persist_warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::{Result as StoreResult, StoreError};
    use crate::memory::MemoryStore;
    use crate::storage::KeyValueReadings;
    use crate::timestamp::{format_timestamp, Precision};
    use crate::types::{CacheRecord, Reading};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const READINGS_KEY: &str = "TemperatureSensorData";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 37, 12).unwrap()
    }

    fn reading_at(offset: ChronoDuration, temperature: f64) -> Reading {
        let instant = (now() - offset).naive_utc();
        Reading::new(format_timestamp(instant, Precision::Full), temperature)
    }

    /// Counts fetches and delegates to an inner source.
    struct CountingSource<S> {
        inner: S,
        fetches: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl<S: ReadingSource> ReadingSource for CountingSource<S> {
        async fn fetch_all(&self) -> StoreResult<HashMap<String, Reading>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_all().await
        }
    }

    struct UnreachableSource;

    #[async_trait::async_trait]
    impl ReadingSource for UnreachableSource {
        async fn fetch_all(&self) -> StoreResult<HashMap<String, Reading>> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowSource;

    #[async_trait::async_trait]
    impl ReadingSource for SlowSource {
        async fn fetch_all(&self) -> StoreResult<HashMap<String, Reading>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HashMap::new())
        }
    }

    /// Reads succeed, writes fail.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
            self.0.get(path).await
        }

        async fn put(&self, _path: &str, _value: Value) -> StoreResult<()> {
            Err(StoreError::Unavailable("read-only replica".to_string()))
        }
    }

    /// Reads find nothing, writes never finish.
    struct StalledStore;

    #[async_trait::async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _path: &str) -> StoreResult<Option<Value>> {
            Ok(None)
        }

        async fn put(&self, _path: &str, _value: Value) -> StoreResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _path: &str) -> StoreResult<Option<Value>> {
            Err(StoreError::Unavailable("store offline".to_string()))
        }

        async fn put(&self, _path: &str, _value: Value) -> StoreResult<()> {
            Err(StoreError::Unavailable("store offline".to_string()))
        }
    }

    struct Harness {
        store: MemoryStore,
        source: Arc<CountingSource<KeyValueReadings<MemoryStore>>>,
        clock: Arc<FixedClock>,
        coordinator: AggregateCoordinator,
    }

    fn harness(readings: &[Reading]) -> Harness {
        let store = MemoryStore::new();
        for (i, reading) in readings.iter().enumerate() {
            store
                .insert_reading(READINGS_KEY, &format!("r{}", i), reading)
                .unwrap();
        }
        let source = Arc::new(CountingSource {
            inner: KeyValueReadings::new(store.clone(), READINGS_KEY),
            fetches: AtomicUsize::new(0),
        });
        let clock = Arc::new(FixedClock::new(now()));
        let coordinator = AggregateCoordinator::new(
            source.clone(),
            Arc::new(store.clone()),
            clock.clone(),
            AggregationSettings::default(),
        );
        Harness {
            store,
            source,
            clock,
            coordinator,
        }
    }

    async fn seed_cache(store: &MemoryStore, last_updated: i64) -> CacheRecord {
        let averages = compute_aggregates(&[reading_at(ChronoDuration::hours(3), 5.0)], now().naive_utc());
        let record = CacheRecord {
            averages,
            last_updated,
        };
        store
            .put(AVERAGES_KEY, serde_json::to_value(&record).unwrap())
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_fresh_cache_served_without_fetch() {
        let h = harness(&[reading_at(ChronoDuration::minutes(90), 30.0)]);
        let ten_minutes_ago = (now() - ChronoDuration::minutes(10)).timestamp_millis();
        let record = seed_cache(&h.store, ten_minutes_ago).await;

        let outcome = h.coordinator.get_aggregates().await.unwrap();

        assert_eq!(outcome.origin, Origin::Cached);
        assert_eq!(outcome.averages, record.averages);
        assert_eq!(outcome.last_updated, ten_minutes_ago);
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_recomputed_and_persisted() {
        let h = harness(&[
            reading_at(ChronoDuration::minutes(90), 10.0),
            reading_at(ChronoDuration::minutes(80), 20.0),
            reading_at(ChronoDuration::minutes(70), 30.0),
        ]);
        let two_hours_ago = (now() - ChronoDuration::hours(2)).timestamp_millis();
        let stale = seed_cache(&h.store, two_hours_ago).await;

        let outcome = h.coordinator.get_aggregates().await.unwrap();

        assert_eq!(outcome.origin, Origin::Recomputed);
        assert_ne!(outcome.averages, stale.averages);
        assert_eq!(outcome.last_updated, now().timestamp_millis());
        assert!(outcome.persist_warning.is_none());
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
        // 13:07, 13:17 and 13:27 all fall in [13:00, 14:00)
        let newest = outcome.averages.last_24_hour_averages.last().unwrap();
        assert_eq!(newest.timestamp, "15/06/2024, 14:00");
        assert_eq!(newest.temperature, 20.0);

        let persisted: CacheRecord =
            serde_json::from_value(h.store.get(AVERAGES_KEY).await.unwrap().unwrap()).unwrap();
        assert_eq!(persisted.last_updated, now().timestamp_millis());
        assert_eq!(persisted.averages, outcome.averages);

        // A second call inside the window is a cache hit
        h.clock.advance(ChronoDuration::minutes(30));
        let again = h.coordinator.get_aggregates().await.unwrap();
        assert_eq!(again.origin, Origin::Cached);
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_readings_outside_windows_give_all_zero_buckets() {
        let h = harness(&[reading_at(ChronoDuration::days(45), 50.0)]);

        let outcome = h.coordinator.get_aggregates().await.unwrap();
        let set = &outcome.averages;

        assert_eq!(set.last_24_hour_averages.len(), 24);
        assert_eq!(set.last_week_averages.len(), 7);
        assert_eq!(set.last_month_averages.len(), 30);
        assert!(set
            .last_24_hour_averages
            .iter()
            .chain(&set.last_week_averages)
            .chain(&set.last_month_averages)
            .all(|entry| entry.temperature == 0.0));
    }

    #[tokio::test]
    async fn test_malformed_reading_does_not_abort() {
        let h = harness(&[
            Reading::new("15-06-2024 13:30", 500.0),
            reading_at(ChronoDuration::minutes(60), 21.5),
        ]);

        let outcome = h.coordinator.get_aggregates().await.unwrap();
        assert_eq!(
            outcome.averages.last_24_hour_averages.last().unwrap().temperature,
            21.5
        );
    }

    #[tokio::test]
    async fn test_empty_source_is_unavailable_and_cache_untouched() {
        let h = harness(&[]);
        let two_hours_ago = (now() - ChronoDuration::hours(2)).timestamp_millis();
        seed_cache(&h.store, two_hours_ago).await;
        let before = h.store.get(AVERAGES_KEY).await.unwrap();

        let err = h.coordinator.get_aggregates().await.unwrap_err();
        assert!(matches!(err, AggregateError::SourceUnavailable(_)));
        assert_eq!(h.store.get(AVERAGES_KEY).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_without_stale_fallback() {
        let store = MemoryStore::new();
        let two_hours_ago = (now() - ChronoDuration::hours(2)).timestamp_millis();
        seed_cache(&store, two_hours_ago).await;

        let coordinator = AggregateCoordinator::new(
            Arc::new(UnreachableSource),
            Arc::new(store.clone()),
            Arc::new(FixedClock::new(now())),
            AggregationSettings::default(),
        );

        match coordinator.get_aggregates().await {
            Err(AggregateError::SourceUnavailable(msg)) => {
                assert!(msg.contains("connection refused"))
            }
            other => panic!("expected SourceUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persist_failure_still_returns_fresh_averages() {
        let backing = MemoryStore::new();
        backing
            .insert_reading(READINGS_KEY, "a", &reading_at(ChronoDuration::minutes(45), 18.0))
            .unwrap();

        let coordinator = AggregateCoordinator::new(
            Arc::new(KeyValueReadings::new(backing.clone(), READINGS_KEY)),
            Arc::new(ReadOnlyStore(backing.clone())),
            Arc::new(FixedClock::new(now())),
            AggregationSettings::default(),
        );

        let outcome = coordinator.get_aggregates().await.unwrap();
        assert_eq!(outcome.origin, Origin::Recomputed);
        assert!(outcome.averages.is_complete());
        assert!(matches!(
            outcome.persist_warning,
            Some(CacheError::Persist(_))
        ));
        assert_eq!(backing.get(AVERAGES_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_timeout_still_returns_fresh_averages() {
        let backing = MemoryStore::new();
        backing
            .insert_reading(READINGS_KEY, "a", &reading_at(ChronoDuration::minutes(45), 18.0))
            .unwrap();
        let settings = AggregationSettings {
            request_timeout: Some(Duration::from_millis(50)),
            ..AggregationSettings::default()
        };
        let coordinator = AggregateCoordinator::new(
            Arc::new(KeyValueReadings::new(backing, READINGS_KEY)),
            Arc::new(StalledStore),
            Arc::new(FixedClock::new(now())),
            settings,
        );

        let outcome = coordinator.get_aggregates().await.unwrap();
        assert_eq!(outcome.origin, Origin::Recomputed);
        assert_eq!(
            outcome.averages.last_24_hour_averages.last().unwrap().temperature,
            18.0
        );
        assert!(matches!(
            outcome.persist_warning,
            Some(CacheError::PersistTimedOut)
        ));
    }

    #[tokio::test]
    async fn test_cache_load_failure_propagates() {
        let coordinator = AggregateCoordinator::new(
            Arc::new(UnreachableSource),
            Arc::new(BrokenStore),
            Arc::new(FixedClock::new(now())),
            AggregationSettings::default(),
        );

        let err = coordinator.get_aggregates().await.unwrap_err();
        assert!(matches!(
            err,
            AggregateError::CacheUnavailable(CacheError::Load(_))
        ));
    }

    #[tokio::test]
    async fn test_utc_offset_shifts_bucket_labels() {
        let store = MemoryStore::new();
        // 14:37 UTC is 16:37 at UTC+2; the reading is local time
        store
            .insert_reading(READINGS_KEY, "a", &Reading::new("15/06/2024, 15:30:00", 25.0))
            .unwrap();

        let settings = AggregationSettings {
            utc_offset: FixedOffset::east_opt(2 * 3600).unwrap(),
            ..AggregationSettings::default()
        };
        let coordinator = AggregateCoordinator::new(
            Arc::new(KeyValueReadings::new(store.clone(), READINGS_KEY)),
            Arc::new(store),
            Arc::new(FixedClock::new(now())),
            settings,
        );

        let outcome = coordinator.get_aggregates().await.unwrap();
        let newest = outcome.averages.last_24_hour_averages.last().unwrap();
        assert_eq!(newest.timestamp, "15/06/2024, 16:00");
        assert_eq!(newest.temperature, 25.0);
        assert_eq!(outcome.last_updated, now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let h = harness(&[reading_at(ChronoDuration::minutes(30), 20.0)]);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .coordinator
            .get_aggregates_cancellable(&token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Cancelled {
                stage: Stage::CacheLoad
            }
        ));
        assert_eq!(h.store.get(AVERAGES_KEY).await.unwrap(), None);
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_fetch() {
        let store = MemoryStore::new();
        let coordinator = AggregateCoordinator::new(
            Arc::new(SlowSource),
            Arc::new(store.clone()),
            Arc::new(FixedClock::new(now())),
            AggregationSettings::default(),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = coordinator
            .get_aggregates_cancellable(&token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Cancelled {
                stage: Stage::FetchReadings
            }
        ));
        assert_eq!(store.get(AVERAGES_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_timeout_during_fetch() {
        let store = MemoryStore::new();
        let settings = AggregationSettings {
            request_timeout: Some(Duration::from_millis(20)),
            ..AggregationSettings::default()
        };
        let coordinator = AggregateCoordinator::new(
            Arc::new(SlowSource),
            Arc::new(store.clone()),
            Arc::new(FixedClock::new(now())),
            settings,
        );

        let err = coordinator.get_aggregates().await.unwrap_err();
        assert!(matches!(
            err,
            AggregateError::TimedOut {
                stage: Stage::FetchReadings
            }
        ));
        assert_eq!(store.get(AVERAGES_KEY).await.unwrap(), None);
    }

    #[test]
    fn test_origin_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Origin::Cached).unwrap(), json!("cached"));
        assert_eq!(
            serde_json::to_value(Origin::Recomputed).unwrap(),
            json!("recomputed")
        );
    }
}
