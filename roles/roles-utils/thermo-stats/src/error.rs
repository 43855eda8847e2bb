//! Error taxonomy shared by the codec, the stores, the cache and the coordinator.

use thiserror::Error;

/// A timestamp string did not match `DD/MM/YYYY, HH:MM:SS`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid timestamp {input:?}: {reason}")]
pub struct FormatError {
    pub input: String,
    pub reason: &'static str,
}

impl FormatError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to load cached averages: {0}")]
    Load(#[source] StoreError),

    #[error("Failed to persist averages: {0}")]
    Persist(#[source] StoreError),

    #[error("Timed out persisting averages")]
    PersistTimedOut,

    #[error("Failed to encode averages: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("Invalid thresholds: {0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The I/O point a coordinator call was suspended at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CacheLoad,
    FetchReadings,
    CachePersist,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::CacheLoad => write!(f, "cache load"),
            Stage::FetchReadings => write!(f, "reading fetch"),
            Stage::CachePersist => write!(f, "cache persist"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Reading source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(#[source] CacheError),

    #[error("Timed out during {stage}")]
    TimedOut { stage: Stage },

    #[error("Cancelled during {stage}")]
    Cancelled { stage: Stage },
}

pub type Result<T> = std::result::Result<T, StoreError>;
