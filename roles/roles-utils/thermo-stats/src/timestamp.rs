//! Codec for the sensor timestamp layout `DD/MM/YYYY, HH:MM:SS`.
//!
//! Readings carry the sensor's local capture time with no zone designator, so
//! parsed values are [`NaiveDateTime`]s and no conversion is ever applied here.
//! Bucket labels are rendered at minute precision for hourly buckets and at day
//! precision for daily ones.

use chrono::NaiveDateTime;

use crate::error::FormatError;

const FULL_FORMAT: &str = "%d/%m/%Y, %H:%M:%S";
const MINUTE_FORMAT: &str = "%d/%m/%Y, %H:%M";
const DAY_FORMAT: &str = "%d/%m/%Y";

/// Byte layout of a full timestamp. `9` marks a digit, anything else must match literally.
const LAYOUT: &[u8; 20] = b"99/99/9999, 99:99:99";

/// Rendering precision for [`format_timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// `DD/MM/YYYY, HH:MM:SS`
    Full,
    /// `DD/MM/YYYY, HH:MM`, used for hourly bucket labels
    Minute,
    /// `DD/MM/YYYY`, used for daily bucket labels
    Day,
}

impl Precision {
    fn pattern(self) -> &'static str {
        match self {
            Precision::Full => FULL_FORMAT,
            Precision::Minute => MINUTE_FORMAT,
            Precision::Day => DAY_FORMAT,
        }
    }
}

/// Parse a `DD/MM/YYYY, HH:MM:SS` timestamp.
///
/// The layout is checked byte for byte before chrono validates the calendar
/// values, so single-digit fields, ISO strings and trailing garbage are all
/// rejected rather than leniently accepted.
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, FormatError> {
    let bytes = text.as_bytes();
    if bytes.len() != LAYOUT.len() {
        return Err(FormatError::new(text, "expected DD/MM/YYYY, HH:MM:SS"));
    }

    let layout_ok = bytes.iter().zip(LAYOUT.iter()).all(|(&b, &expected)| {
        if expected == b'9' {
            b.is_ascii_digit()
        } else {
            b == expected
        }
    });
    if !layout_ok {
        return Err(FormatError::new(text, "expected DD/MM/YYYY, HH:MM:SS"));
    }

    NaiveDateTime::parse_from_str(text, FULL_FORMAT)
        .map_err(|_| FormatError::new(text, "field out of range"))
}

/// Render an instant at the requested precision, zero-padding every field.
pub fn format_timestamp(instant: NaiveDateTime, precision: Precision) -> String {
    instant.format(precision.pattern()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate};
    use quickcheck_macros::quickcheck;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_parse_valid() {
        let parsed = parse_timestamp("05/03/2024, 07:08:09").unwrap();
        assert_eq!(parsed, at(2024, 3, 5, 7, 8, 9));
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        for bad in [
            "2024-03-05T07:08:09",
            "5/3/2024, 7:08:09",
            "05/03/2024 07:08:09",
            "05/03/2024, 07:08",
            "05/03/2024, 07:08:09 ",
            "",
        ] {
            let err = parse_timestamp(bad).unwrap_err();
            assert_eq!(err.input, bad);
        }
    }

    #[test]
    fn test_parse_rejects_impossible_dates() {
        assert!(parse_timestamp("31/02/2024, 10:00:00").is_err());
        assert!(parse_timestamp("01/13/2024, 10:00:00").is_err());
        assert!(parse_timestamp("01/01/2024, 24:00:00").is_err());
    }

    #[test]
    fn test_format_precisions() {
        let instant = at(2024, 1, 9, 4, 5, 6);
        assert_eq!(format_timestamp(instant, Precision::Full), "09/01/2024, 04:05:06");
        assert_eq!(format_timestamp(instant, Precision::Minute), "09/01/2024, 04:05");
        assert_eq!(format_timestamp(instant, Precision::Day), "09/01/2024");
    }

    #[quickcheck]
    fn prop_full_format_round_trips(secs: u32) -> bool {
        let instant = DateTime::from_timestamp(secs as i64, 0).unwrap().naive_utc();
        parse_timestamp(&format_timestamp(instant, Precision::Full)) == Ok(instant)
    }
}
