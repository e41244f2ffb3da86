//! Calendar arithmetic: wall-clock dates and times in a business timezone
//! converted to and from absolute instants, plus the candidate slot grid.
//!
//! Everything here is pure. The only failure mode is malformed input.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::model::{MINUTE_MS, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    InvalidDate(String),
    InvalidTime(String),
    InvalidTimezone(String),
    /// The wall-clock time falls in a daylight-saving gap.
    NonexistentLocalTime(NaiveDateTime),
    InvalidInstant(Ms),
    InvalidGrid(&'static str),
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::InvalidDate(s) => write!(f, "invalid date '{s}' (expected YYYY-MM-DD)"),
            CalendarError::InvalidTime(s) => write!(f, "invalid time '{s}' (expected HH:MM)"),
            CalendarError::InvalidTimezone(s) => write!(f, "invalid timezone '{s}'"),
            CalendarError::NonexistentLocalTime(dt) => {
                write!(f, "local time {dt} does not exist in this timezone")
            }
            CalendarError::InvalidInstant(ms) => write!(f, "instant {ms} out of range"),
            CalendarError::InvalidGrid(msg) => write!(f, "invalid slot grid: {msg}"),
        }
    }
}

impl std::error::Error for CalendarError {}

pub fn parse_timezone(s: &str) -> Result<Tz, CalendarError> {
    s.parse::<Tz>()
        .map_err(|_| CalendarError::InvalidTimezone(s.to_string()))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| CalendarError::InvalidDate(s.to_string()))
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, CalendarError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| CalendarError::InvalidTime(s.to_string()))
}

/// 0 = Sunday … 6 = Saturday. A calendar date names the same weekday in every
/// timezone; callers resolve "which date" in the business timezone first.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Wall-clock `date time` in `tz` as an absolute instant.
///
/// Ambiguous times (the repeated hour when clocks fall back) resolve to the
/// earlier instant. Times inside a spring-forward gap are rejected.
pub fn to_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Result<Ms, CalendarError> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or(CalendarError::NonexistentLocalTime(naive))
}

/// Like [`to_instant`], but a time inside a spring-forward gap maps to the
/// first instant after the gap. Used for window boundaries, where "09:00"
/// on a day that skips 09:00 still means "from opening".
pub fn to_instant_or_after(date: NaiveDate, time: NaiveTime, tz: Tz) -> Result<Ms, CalendarError> {
    let naive = date.and_time(time);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Ok(dt.timestamp_millis());
    }
    // Gaps are at most a few hours; walk forward minute by minute.
    for minutes in 1..=(4 * 60) {
        let shifted = naive + Duration::minutes(minutes);
        if let Some(dt) = tz.from_local_datetime(&shifted).earliest() {
            return Ok(dt.timestamp_millis());
        }
    }
    Err(CalendarError::NonexistentLocalTime(naive))
}

fn local(instant: Ms, tz: Tz) -> Result<DateTime<Tz>, CalendarError> {
    DateTime::from_timestamp_millis(instant)
        .map(|utc| utc.with_timezone(&tz))
        .ok_or(CalendarError::InvalidInstant(instant))
}

/// Business-local calendar date of an instant.
pub fn local_date(instant: Ms, tz: Tz) -> Result<NaiveDate, CalendarError> {
    Ok(local(instant, tz)?.date_naive())
}

/// Business-local `HH:MM` (24h) label of an instant.
pub fn time_label(instant: Ms, tz: Tz) -> Result<String, CalendarError> {
    let l = local(instant, tz)?;
    Ok(format!("{:02}:{:02}", l.hour(), l.minute()))
}

/// `[start of date, start of next date)` in `tz`.
pub fn day_window(date: NaiveDate, tz: Tz) -> Result<(Ms, Ms), CalendarError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| CalendarError::InvalidDate(date.to_string()))?;
    Ok((
        to_instant_or_after(date, NaiveTime::MIN, tz)?,
        to_instant_or_after(next, NaiveTime::MIN, tz)?,
    ))
}

/// Candidate start instants from `window_start`, stepping by `step_minutes`,
/// keeping only candidates whose `[candidate, candidate + duration)` fits
/// inside the window.
pub fn slot_grid(
    window_start: Ms,
    window_end: Ms,
    step_minutes: i64,
    duration: Ms,
) -> Result<Vec<Ms>, CalendarError> {
    if step_minutes <= 0 {
        return Err(CalendarError::InvalidGrid("step must be positive"));
    }
    if duration <= 0 {
        return Err(CalendarError::InvalidGrid("duration must be positive"));
    }
    if window_end < window_start {
        return Err(CalendarError::InvalidGrid("window ends before it starts"));
    }
    let step = step_minutes * MINUTE_MS;
    let mut grid = Vec::new();
    let mut candidate = window_start;
    while candidate + duration <= window_end {
        grid.push(candidate);
        candidate += step;
    }
    Ok(grid)
}
