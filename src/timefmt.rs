//! Timestamp parsing and formatting.
//!
//! The public API and the provider's files both carry naive local
//! timestamps ("YYYY/MM/DD HH:MM:SS"). Internally everything is a
//! microsecond count from the Unix epoch, interpreted in the market's
//! local clock with no offset applied.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{Error, Result};

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const FIVE_MINUTES_MICROS: i64 = 300 * MICROS_PER_SECOND;

/// Parse the public API format `YYYY/MM/DD HH:MM:SS`.
pub fn parse_api_time(text: &str) -> Result<i64> {
    parse_datetime(text)
        .ok_or_else(|| Error::UserInput(format!("expected YYYY/MM/DD HH:MM:SS, got '{text}'")))
}

/// Parse a timestamp cell from a provider file.
///
/// Accepts `/` or `-` date separators and an optional time-of-day part;
/// the provider has used both across the history of the archive.
/// Returns `None` on anything else so callers can segregate the row.
pub fn parse_row_time(text: &str) -> Option<i64> {
    parse_datetime(text.trim().trim_matches('"'))
}

fn parse_datetime(text: &str) -> Option<i64> {
    let (date_part, time_part) = match text.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };

    let sep = if date_part.contains('/') { '/' } else { '-' };
    let mut fields = date_part.split(sep);
    let year: i32 = fields.next()?.parse().ok()?;
    let month: u8 = fields.next()?.parse().ok()?;
    let day: u8 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;

    let time = match time_part {
        Some(t) => {
            let mut fields = t.split(':');
            let hour: u8 = fields.next()?.parse().ok()?;
            let minute: u8 = fields.next()?.parse().ok()?;
            let second: u8 = match fields.next() {
                Some(s) => s.parse().ok()?,
                None => 0,
            };
            Time::from_hms(hour, minute, second).ok()?
        }
        None => Time::MIDNIGHT,
    };

    Some(datetime_to_micros(PrimitiveDateTime::new(date, time)))
}

pub fn datetime_to_micros(dt: PrimitiveDateTime) -> i64 {
    (dt.assume_utc().unix_timestamp_nanos() / 1_000) as i64
}

pub fn micros_to_datetime(micros: i64) -> Result<PrimitiveDateTime> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
        .map_err(|err| Error::UserInput(format!("timestamp out of range: {err}")))?;
    Ok(PrimitiveDateTime::new(dt.date(), dt.time()))
}

pub fn format_datetime(micros: i64) -> String {
    match micros_to_datetime(micros) {
        Ok(dt) => format!(
            "{:04}/{:02}/{:02} {:02}:{:02}:{:02}",
            dt.year(),
            dt.month() as u8,
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ),
        Err(_) => micros.to_string(),
    }
}

/// Truncate a timestamp down to the start of its 5-minute bucket.
pub fn truncate_to_five_minutes(micros: i64) -> i64 {
    micros - micros.rem_euclid(FIVE_MINUTES_MICROS)
}

/// Truncate a timestamp down to an arbitrary bucket width.
pub fn truncate_to_interval(micros: i64, interval_micros: i64) -> i64 {
    micros - micros.rem_euclid(interval_micros)
}
