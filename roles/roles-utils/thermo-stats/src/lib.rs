//! Temperature rollups with a persisted read-through cache.
//!
//! This crate turns a stream of timestamped sensor readings into three
//! rollups (24 hourly, 7 daily and 30 daily averages) and keeps the latest
//! result in a key-value store so most requests never touch raw history.

pub mod average;
pub mod bucketing;
pub mod cache;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod recent;
pub mod sqlite;
pub mod storage;
pub mod thresholds;
pub mod timestamp;
pub mod types;

pub use cache::{AggregationCache, AVERAGES_KEY, DEFAULT_STALE_WINDOW};
pub use clock::{Clock, FixedClock, SystemClock};
pub use coordinator::{AggregateCoordinator, AggregateOutcome, AggregationSettings, Origin};
pub use error::{AggregateError, CacheError, FormatError, StoreError, ThresholdError};
pub use memory::MemoryStore;
pub use recent::{recent_readings, DEFAULT_RECENT_LIMIT, MAX_RECENT_LIMIT};
pub use sqlite::SqliteStorage;
pub use storage::{KeyValueReadings, KeyValueStore, ReadingSource, Subscribe, Subscription};
pub use thresholds::{ThresholdConfig, ThresholdStore, THRESHOLDS_KEY};
pub use timestamp::{format_timestamp, parse_timestamp, Precision};
pub use types::{AggregateSet, AverageEntry, Bucket, CacheRecord, Reading};

/// Default key of the raw reading collection.
pub const READINGS_KEY: &str = "TemperatureSensorData";
