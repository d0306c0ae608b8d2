//! Shared timestamp helpers
//!
//! Every table stores timestamps as fixed-width RFC3339 UTC strings with
//! millisecond precision, so plain string comparison in SQL orders them
//! chronologically.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Format a timestamp for storage
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp from storage or a provider payload
///
/// Accepts RFC3339 (with or without fractional seconds) and the naive
/// `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS` forms, which are read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    None
}

/// Parse an optional stored timestamp column
pub(crate) fn parse_opt_timestamp(value: &Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 11, 15, 10, 30, 59).unwrap();
        assert_eq!(format_timestamp(&a), "2024-01-05T09:00:00.000Z");
        assert_eq!(format_timestamp(&a).len(), format_timestamp(&b).len());
        assert!(format_timestamp(&a) < format_timestamp(&b));
    }

    #[test]
    fn test_parse_rfc3339_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T10:05:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:05:00.000Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T05:05:00-05:00"), Some(expected));
    }

    #[test]
    fn test_parse_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01 10:05:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:05:00"), Some(expected));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_round_trip_through_storage_format() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)), Some(ts));
    }
}
