//! The newest readings, for live displays that pull instead of subscribing.

use chrono::NaiveDateTime;

use crate::error::Result;
use crate::storage::ReadingSource;
use crate::timestamp::parse_timestamp;
use crate::types::Reading;

/// Readings returned when the caller does not ask for a count.
pub const DEFAULT_RECENT_LIMIT: usize = 30;
/// Upper bound on one request.
pub const MAX_RECENT_LIMIT: usize = 1000;

/// The `limit` newest readings, oldest first.
///
/// Ordered by capture time, then by key for readings sharing a timestamp.
/// Readings whose timestamp does not parse are left out.
pub async fn recent_readings<S>(source: &S, limit: usize) -> Result<Vec<Reading>>
where
    S: ReadingSource + ?Sized,
{
    let mut dated: Vec<(NaiveDateTime, String, Reading)> = source
        .fetch_all()
        .await?
        .into_iter()
        .filter_map(|(key, reading)| {
            let at = parse_timestamp(&reading.timestamp).ok()?;
            Some((at, key, reading))
        })
        .collect();

    dated.sort_by(|a, b| (b.0, &b.1).cmp(&(a.0, &a.1)));
    dated.truncate(limit.min(MAX_RECENT_LIMIT));
    dated.reverse();

    Ok(dated.into_iter().map(|(_, _, reading)| reading).collect())
}
