//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC), dates as
//! ISO `YYYY-MM-DD` text.

use chrono::{DateTime, LocalResult, NaiveDate, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Out-of-range values clamp to the nearest representable instant.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
        LocalResult::None if ms.is_negative() => DateTime::<Utc>::MIN_UTC,
        LocalResult::None => DateTime::<Utc>::MAX_UTC,
    }
}

pub fn opt_ms_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_datetime)
}

/// Format a calendar date the way it is stored in `series_record.date`.
pub fn date_to_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn text_to_date(text: &str) -> crate::Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| crate::Error::Database(format!("invalid stored date '{text}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip_and_clamp() {
        let now = Utc::now();
        assert_eq!(
            ms_to_datetime(datetime_to_ms(now)).timestamp_millis(),
            now.timestamp_millis()
        );
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(ms_to_datetime(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_date_text() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(date_to_text(d), "2024-02-29");
        assert_eq!(text_to_date("2024-02-29").unwrap(), d);
        assert!(text_to_date("29/02/2024").is_err());
    }
}
