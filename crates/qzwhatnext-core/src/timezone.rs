use crate::error::EngineError;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Validate IANA timezone name
pub fn validate_timezone(timezone: &str) -> Result<Tz, EngineError> {
    Tz::from_str(timezone).map_err(|_| EngineError::InvalidTimezone(timezone.to_string()))
}

/// Resolve a user-local date to the instant of its midnight in the given
/// timezone. Used for `start_after` lower bounds.
pub fn local_midnight(date: NaiveDate, timezone: &str) -> Result<DateTime<Utc>, EngineError> {
    local_instant(date, NaiveTime::MIN, timezone)
}

/// Resolve a user-local date to the last instant of that day (23:59:59) in
/// the given timezone. Used for `due_by` urgency bounds.
pub fn local_end_of_day(date: NaiveDate, timezone: &str) -> Result<DateTime<Utc>, EngineError> {
    let end = NaiveTime::from_hms_opt(23, 59, 59)
        .ok_or_else(|| EngineError::InvalidInput("invalid end-of-day time".to_string()))?;
    local_instant(date, end, timezone)
}

/// Resolve a local date+time to a UTC instant, handling DST gaps by taking
/// the earliest valid interpretation, shifting forward an hour when the
/// wall-clock time does not exist (spring forward).
fn local_instant(
    date: NaiveDate,
    time: NaiveTime,
    timezone: &str,
) -> Result<DateTime<Utc>, EngineError> {
    let tz = validate_timezone(timezone)?;
    let naive = date.and_time(time);

    match tz.from_local_datetime(&naive).earliest() {
        Some(local_dt) => Ok(local_dt.with_timezone(&Utc)),
        None => {
            let shifted = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!(
                        "no valid instant for {} in {}",
                        naive, timezone
                    ))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_iana_names() {
        assert!(validate_timezone("America/New_York").is_ok());
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("Not/AZone").is_err());
    }

    #[test]
    fn midnight_resolves_with_offset() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let instant = local_midnight(date, "America/New_York").unwrap();
        // EST is UTC-5 in January
        assert_eq!(instant.to_rfc3339(), "2025-01-15T05:00:00+00:00");
    }

    #[test]
    fn end_of_day_follows_midnight() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let midnight = local_midnight(date, "Europe/Berlin").unwrap();
        let eod = local_end_of_day(date, "Europe/Berlin").unwrap();
        assert!(eod > midnight);
        assert_eq!((eod - midnight).num_seconds(), 23 * 3600 + 59 * 60 + 59);
    }

    #[test]
    fn spring_forward_gap_shifts_forward() {
        // 2025-03-09 02:30 does not exist in America/New_York; midnight does,
        // so exercise the gap through a due_by-style resolution at 02:30.
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let time = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        let instant = local_instant(date, time, "America/New_York").unwrap();
        // Shifted into the first valid hour after the gap.
        assert_eq!(instant.to_rfc3339(), "2025-03-09T07:30:00+00:00");
    }
}
