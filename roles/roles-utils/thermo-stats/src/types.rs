//! Readings, buckets and the persisted rollup shapes.

use chrono::NaiveDateTime;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Number of one-hour buckets in [`AggregateSet::last_24_hour_averages`].
pub const HOURLY_BUCKETS: usize = 24;
/// Number of one-day buckets in [`AggregateSet::last_week_averages`].
pub const WEEKLY_BUCKETS: usize = 7;
/// Number of one-day buckets in [`AggregateSet::last_month_averages`].
pub const MONTHLY_BUCKETS: usize = 30;

/// One raw sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Local capture time, `DD/MM/YYYY, HH:MM:SS`
    pub timestamp: String,

    /// Degrees as written by the sensor; accepted as a JSON number or numeric string
    #[serde(deserialize_with = "number_or_string")]
    pub temperature: f64,
}

impl Reading {
    pub fn new(timestamp: impl Into<String>, temperature: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            temperature,
        }
    }
}

/// A computed half-open interval `[start, end)` and the mean of the readings inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Rounded to two decimals; `0.0` when the bucket is empty
    pub average: f64,
    /// Readings that fell inside the interval
    pub samples: usize,
    /// Formatted `end` boundary
    pub label: String,
}

/// Persisted form of a bucket: `{ "timestamp": <label>, "temperature": "<2 decimals>" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageEntry {
    pub timestamp: String,

    #[serde(
        serialize_with = "two_decimal_string",
        deserialize_with = "number_or_string"
    )]
    pub temperature: f64,
}

impl From<&Bucket> for AverageEntry {
    fn from(bucket: &Bucket) -> Self {
        Self {
            timestamp: bucket.label.clone(),
            temperature: bucket.average,
        }
    }
}

/// The three rollups computed together, oldest bucket first in each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSet {
    #[serde(rename = "last24HourAverages")]
    pub last_24_hour_averages: Vec<AverageEntry>,
    pub last_week_averages: Vec<AverageEntry>,
    pub last_month_averages: Vec<AverageEntry>,
}

impl AggregateSet {
    /// True when every sequence has its fixed length.
    pub fn is_complete(&self) -> bool {
        self.last_24_hour_averages.len() == HOURLY_BUCKETS
            && self.last_week_averages.len() == WEEKLY_BUCKETS
            && self.last_month_averages.len() == MONTHLY_BUCKETS
    }
}

/// The single record stored at the averages key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    #[serde(flatten)]
    pub averages: AggregateSet,

    /// Epoch milliseconds of the computation
    pub last_updated: i64,
}

pub(crate) fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(value) => value,
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("temperature is not numeric: {:?}", text)))?,
    };

    // JSON has no NaN or infinity; such a value would be stored as null.
    if !value.is_finite() {
        return Err(de::Error::custom(format!(
            "temperature is not finite: {}",
            value
        )));
    }
    Ok(value)
}

fn two_decimal_string<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{:.2}", value))
}
