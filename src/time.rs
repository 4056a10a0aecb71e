use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::model::Ms;

/// Parse an ISO 8601 instant into Unix milliseconds.
///
/// RFC 3339 input keeps its offset and is normalised to UTC. A bare
/// date-time (`2025-03-01T09:30:00`) or date (`2025-03-01`) is read as UTC.
pub fn parse_instant(input: &str) -> Result<Ms, TimeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TimeError::Empty);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .ok_or_else(|| TimeError::Malformed(s.to_string()));
    }
    Err(TimeError::Malformed(s.to_string()))
}

/// Render Unix milliseconds as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_ms(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    Empty,
    Malformed(String),
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::Empty => write!(f, "empty timestamp"),
            TimeError::Malformed(s) => write!(f, "not a valid ISO 8601 timestamp: {s}"),
        }
    }
}

impl std::error::Error for TimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-01-01T10:00:00Z
    const TEN_AM: Ms = 1_735_725_600_000;

    #[test]
    fn parses_utc_rfc3339() {
        assert_eq!(parse_instant("2025-01-01T10:00:00Z").unwrap(), TEN_AM);
        assert_eq!(parse_instant("2025-01-01T10:00:00.000Z").unwrap(), TEN_AM);
    }

    #[test]
    fn offset_is_normalised_to_utc() {
        assert_eq!(parse_instant("2025-01-01T12:00:00+02:00").unwrap(), TEN_AM);
        assert_eq!(parse_instant("2025-01-01T05:00:00-05:00").unwrap(), TEN_AM);
    }

    #[test]
    fn bare_datetime_is_utc() {
        assert_eq!(parse_instant("2025-01-01T10:00:00").unwrap(), TEN_AM);
        assert_eq!(parse_instant("2025-01-01 10:00:00").unwrap(), TEN_AM);
        assert_eq!(parse_instant("2025-01-01T10:00").unwrap(), TEN_AM);
    }

    #[test]
    fn bare_date_is_midnight_utc() {
        assert_eq!(parse_instant("2025-01-01").unwrap(), TEN_AM - 10 * 3_600_000);
    }

    #[test]
    fn rejects_garbage_and_impossible_dates() {
        assert_eq!(parse_instant("   "), Err(TimeError::Empty));
        assert!(matches!(parse_instant("tomorrow"), Err(TimeError::Malformed(_))));
        assert!(matches!(parse_instant("2025-02-30T10:00:00Z"), Err(TimeError::Malformed(_))));
        assert!(matches!(parse_instant("2025-13-01"), Err(TimeError::Malformed(_))));
    }

    #[test]
    fn format_is_millisecond_utc() {
        assert_eq!(format_ms(TEN_AM), "2025-01-01T10:00:00.000Z");
        assert_eq!(format_ms(TEN_AM + 1), "2025-01-01T10:00:00.001Z");
    }

    #[test]
    fn format_then_parse_is_stable() {
        let s = format_ms(TEN_AM + 123);
        assert_eq!(parse_instant(&s).unwrap(), TEN_AM + 123);
    }
}
