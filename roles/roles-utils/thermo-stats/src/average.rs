//! Averaging helpers for bucketed readings.

/// Round to two decimal places, half away from zero.
pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Arithmetic mean of `temperatures`, rounded to two decimals.
///
/// An empty bucket averages to `0.0`; callers cannot tell it apart from a
/// bucket whose readings genuinely average to zero.
pub fn mean_temperature<I>(temperatures: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = temperatures
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), t| (sum + t, count + 1));

    if count == 0 {
        0.0
    } else {
        round_to_cents(sum / count as f64)
    }
}
