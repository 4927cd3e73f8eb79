//! Local wall-clock helpers. Nothing here knows about time zones: a `Ms`
//! value is the local calendar reading expressed as milliseconds.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::engine::ValidationError;
use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Map a stored weekday onto the 0 = Sunday .. 6 = Saturday convention.
///
/// Rules store ISO weekdays (1 = Monday .. 7 = Sunday), but the rule editor
/// also wrote Sunday as 0. Both Sunday encodings map to 0; 1..=6 are unchanged.
pub fn sunday_based_weekday(stored: u8) -> Result<u32, ValidationError> {
    match stored {
        0 | 7 => Ok(0),
        1..=6 => Ok(u32::from(stored)),
        other => Err(ValidationError::BadWeekday(other)),
    }
}

/// Weekday of a calendar day, 0 = Sunday.
pub fn weekday_of(day: NaiveDate) -> u32 {
    day.weekday().num_days_from_sunday()
}

/// Parse `HH:MM` or `HH:MM:SS` into minutes after midnight. Seconds are dropped.
/// `24:00` is accepted as the end of the day.
pub fn parse_wall_time(s: &str) -> Result<i64, ValidationError> {
    let trimmed = s.trim();
    if trimmed == "24:00" || trimmed == "24:00:00" {
        return Ok(24 * 60);
    }
    let time = NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| ValidationError::BadTime(s.to_string()))?;
    Ok(i64::from(time.hour()) * 60 + i64::from(time.minute()))
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Local midnight at the start of `day`.
pub fn day_start_ms(day: NaiveDate) -> Ms {
    to_ms(day.and_time(NaiveTime::MIN))
}

/// Calendar day a timestamp falls on.
pub fn date_of(ms: Ms) -> Result<NaiveDate, ValidationError> {
    from_ms(ms)
        .map(|dt| dt.date())
        .ok_or(ValidationError::DateOutOfRange)
}

/// Fixed-width `YYYY-MM-DD`, so keys sort lexicographically by date.
pub fn date_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// `YYYY-MM-DDTHH:MM:SS`, falling back to the raw number when out of range.
pub fn format_iso(ms: Ms) -> String {
    match from_ms(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

/// Combine a day with an `HH:MM` wall time.
pub fn at_wall_time(day: NaiveDate, time: &str) -> Result<Ms, ValidationError> {
    Ok(day_start_ms(day) + parse_wall_time(time)? * MINUTE_MS)
}

pub fn local_now_ms() -> Ms {
    to_ms(Local::now().naive_local())
}

pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}
