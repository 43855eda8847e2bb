//! Fixed-width bucketing of readings into hourly and daily averages.
//!
//! Every rollup is a fixed number of contiguous half-open intervals
//! `[start, end)` laid back-to-back from a boundary instant:
//!
//! - Hourly buckets end at the start of the current hour, so the newest bucket
//!   always covers a completed hour and never the partially elapsed one.
//! - Daily buckets end at `now` itself. Offsets are exact multiples of 24
//!   hours from the request instant and are *not* aligned to midnight.
//!
//! Each bucket's average is the mean of the temperatures inside it, rounded to
//! two decimals, or `0` when nothing fell inside. Buckets are returned oldest
//! first.
//!
//! Every bucket scans the full sample set independently, which is
//! `O(readings × buckets)`. That is fine for tens of thousands of readings.
//!
//! # Examples
//!
//! ```ignore
//! use thermo_stats::bucketing::hourly_averages;
//!
//! let buckets = hourly_averages(&readings, now);
//! assert_eq!(buckets.len(), 24);
//! assert!(buckets.windows(2).all(|w| w[0].end == w[1].start));
//! ```

use chrono::{Duration, NaiveDateTime, Timelike};
use tracing::{debug, warn};

use crate::average::mean_temperature;
use crate::timestamp::{format_timestamp, parse_timestamp, Precision};
use crate::types::{
    AggregateSet, AverageEntry, Bucket, Reading, HOURLY_BUCKETS, MONTHLY_BUCKETS, WEEKLY_BUCKETS,
};

/// A reading whose timestamp has already been parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: NaiveDateTime,
    pub temperature: f64,
}

/// Parse every reading's timestamp, skipping (and logging) the malformed ones.
///
/// A single bad record never aborts aggregation of the rest.
pub fn parse_samples<'a, I>(readings: I) -> Vec<Sample>
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut skipped = 0usize;
    let samples: Vec<Sample> = readings
        .into_iter()
        .filter_map(|reading| match parse_timestamp(&reading.timestamp) {
            Ok(at) => Some(Sample {
                at,
                temperature: reading.temperature,
            }),
            Err(e) => {
                skipped += 1;
                warn!("Skipping reading with malformed timestamp: {}", e);
                None
            }
        })
        .collect();

    if skipped > 0 {
        warn!("Skipped {} of {} readings", skipped, skipped + samples.len());
    }

    samples
}

/// Zero out minutes, seconds and sub-second precision.
pub fn truncate_to_hour(now: NaiveDateTime) -> NaiveDateTime {
    let into_hour = Duration::seconds(i64::from(now.minute() * 60 + now.second()))
        + Duration::nanoseconds(i64::from(now.nanosecond()));
    now - into_hour
}

/// `count` contiguous buckets of width `period`, the newest ending at `boundary`.
///
/// Built newest first, then reversed so the result is chronological.
fn bucket_series(
    samples: &[Sample],
    boundary: NaiveDateTime,
    period: Duration,
    count: usize,
    precision: Precision,
) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = (0..count)
        .map(|i| {
            let end = boundary - period * i as i32;
            let start = end - period;

            let inside: Vec<f64> = samples
                .iter()
                .filter(|s| start <= s.at && s.at < end)
                .map(|s| s.temperature)
                .collect();

            Bucket {
                start,
                end,
                average: mean_temperature(inside.iter().copied()),
                samples: inside.len(),
                label: format_timestamp(end, precision),
            }
        })
        .collect();

    buckets.reverse();
    buckets
}

/// The 24 completed hours before the start of `now`'s hour.
pub fn hourly_samples(samples: &[Sample], now: NaiveDateTime) -> Vec<Bucket> {
    bucket_series(
        samples,
        truncate_to_hour(now),
        Duration::hours(1),
        HOURLY_BUCKETS,
        Precision::Minute,
    )
}

/// `count` one-day buckets, the newest ending exactly at `now`.
pub fn daily_samples(samples: &[Sample], now: NaiveDateTime, count: usize) -> Vec<Bucket> {
    bucket_series(samples, now, Duration::days(1), count, Precision::Day)
}

/// Hourly averages straight from raw readings.
pub fn hourly_averages(readings: &[Reading], now: NaiveDateTime) -> Vec<Bucket> {
    hourly_samples(&parse_samples(readings), now)
}

/// Daily averages straight from raw readings.
pub fn daily_averages(readings: &[Reading], now: NaiveDateTime, count: usize) -> Vec<Bucket> {
    daily_samples(&parse_samples(readings), now, count)
}

/// Compute all three rollups, parsing each reading's timestamp once.
pub fn compute_aggregates<'a, I>(readings: I, now: NaiveDateTime) -> AggregateSet
where
    I: IntoIterator<Item = &'a Reading>,
{
    let samples = parse_samples(readings);
    debug!("Bucketing {} samples at {}", samples.len(), now);

    let entries = |buckets: Vec<Bucket>| -> Vec<AverageEntry> {
        buckets.iter().map(AverageEntry::from).collect()
    };

    AggregateSet {
        last_24_hour_averages: entries(hourly_samples(&samples, now)),
        last_week_averages: entries(daily_samples(&samples, now, WEEKLY_BUCKETS)),
        last_month_averages: entries(daily_samples(&samples, now, MONTHLY_BUCKETS)),
    }
}
