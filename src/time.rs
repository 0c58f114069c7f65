//! Conversions between calendar values and [`Ms`].
//!
//! All times are naive wall-clock times in a single implicit timezone; the
//! millisecond values are computed as if that zone were UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::model::{Ms, Span};

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// `[date @ start, date @ end)` for the configured working hours.
pub fn day_window(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Span {
    Span::new(to_ms(date.and_time(start)), to_ms(date.and_time(end)))
}

/// ISO-8601 local date-time: `2030-01-02T10:00`, with seconds only when non-zero.
pub fn format_ms(ms: Ms) -> String {
    match from_ms(ms) {
        Some(dt) if dt.second() == 0 && dt.nanosecond() == 0 => {
            dt.format("%Y-%m-%dT%H:%M").to_string()
        }
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

/// Parse an ISO local date-time (`T` or space separated, optional seconds).
pub fn parse_datetime(s: &str) -> Option<Ms> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let s = s.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(to_ms)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse a time of day, `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn format_omits_zero_seconds() {
        let ms = parse_datetime("2030-01-02T10:00").unwrap();
        assert_eq!(format_ms(ms), "2030-01-02T10:00");
        assert_eq!(format_ms(ms + 15_000), "2030-01-02T10:00:15");
    }

    #[test]
    fn parse_accepts_space_and_seconds() {
        let a = parse_datetime("2030-01-02T10:30").unwrap();
        let b = parse_datetime("2030-01-02 10:30:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_datetime("2030-01-02").is_none());
        assert!(parse_datetime("tomorrow").is_none());
    }

    #[test]
    fn day_window_spans_working_hours() {
        let w = day_window(
            date("2030-01-02"),
            parse_time_of_day("09:00").unwrap(),
            parse_time_of_day("12:00").unwrap(),
        );
        assert_eq!(w.duration_ms(), 3 * 3_600_000);
        assert_eq!(format_ms(w.start), "2030-01-02T09:00");
        assert_eq!(format_ms(w.end), "2030-01-02T12:00");
    }

    #[test]
    fn time_of_day_formats() {
        assert_eq!(
            parse_time_of_day("09:30"),
            NaiveTime::from_hms_opt(9, 30, 0)
        );
        assert_eq!(
            parse_time_of_day("17:00:30"),
            NaiveTime::from_hms_opt(17, 0, 30)
        );
        assert!(parse_time_of_day("25:00").is_none());
    }
}
