//! Wall-clock time for nodes and the aggregator.
//!
//! Time travels over the radio as the real-time-clock tuple
//! `(year, month, day, weekday, hour, minute, second, subseconds)`, e.g.
//! `(2024, 5, 29, 2, 7, 11, 1, 0)`. The tuple is parsed field by field with
//! range checks; nothing received over the air is ever evaluated.

use core::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Longest wire tuple: `(65535, 12, 31, 6, 23, 59, 59, 0)` plus slack.
pub const WIRE_TIME_LEN: usize = 40;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    #[error("time tuple must have 6, 7 or 8 fields, found {0}")]
    FieldCount(usize),
    #[error("time tuple field {0} is not an unsigned integer")]
    NotANumber(usize),
    #[error("time tuple field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("time tuple is not valid UTF-8")]
    Encoding,
}

/// Calendar date and time of day, second resolution.
///
/// `weekday` follows the RTC convention: Monday = 0 .. Sunday = 6. It is
/// always derived from the date, never trusted from input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Build a validated date/time; the weekday is computed.
    pub fn new(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> Result<Self, TimeError> {
        check("month", month as u32, 1, 12)?;
        check("day", day as u32, 1, days_in_month(year, month) as u32)?;
        check("hour", hour as u32, 0, 23)?;
        check("minute", minute as u32, 0, 59)?;
        check("second", second as u32, 0, 59)?;

        let days = days_from_civil(year as i64, month as u32, day as u32);
        Ok(Self {
            year,
            month,
            day,
            weekday: weekday_from_days(days),
            hour,
            minute,
            second,
        })
    }

    /// Seconds since 1970-01-01 00:00:00.
    pub fn to_unix(&self) -> i64 {
        days_from_civil(self.year as i64, self.month as u32, self.day as u32) * SECS_PER_DAY
            + self.hour as i64 * 3600
            + self.minute as i64 * 60
            + self.second as i64
    }

    /// Inverse of [`DateTime::to_unix`]. Years outside `0..=65535` saturate.
    pub fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(SECS_PER_DAY);
        let rem = secs.rem_euclid(SECS_PER_DAY);
        let (year, month, day) = civil_from_days(days);

        Self {
            year: year.clamp(0, u16::MAX as i64) as u16,
            month: month as u8,
            day: day as u8,
            weekday: weekday_from_days(days),
            hour: (rem / 3600) as u8,
            minute: ((rem % 3600) / 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// Encode as the RTC tuple sent in reply to `GET_TIME`.
    pub fn to_wire(&self) -> heapless::String<WIRE_TIME_LEN> {
        let mut out = heapless::String::new();
        // 40 bytes always fits eight fields of at most five digits.
        let _ = write!(
            out,
            "({}, {}, {}, {}, {}, {}, {}, 0)",
            self.year, self.month, self.day, self.weekday, self.hour, self.minute, self.second
        );
        out
    }

    /// Strictly parse a time tuple.
    ///
    /// Accepts 6, 7 or 8 comma separated unsigned integers, optionally
    /// wrapped in parentheses:
    /// - `Y, M, D, h, m, s`
    /// - `Y, M, D, weekday, h, m, s[, subsecond]` (RTC order)
    ///
    /// A weekday is range checked and then recomputed from the date; a
    /// subsecond field is dropped.
    pub fn parse_wire(text: &str) -> Result<Self, TimeError> {
        let inner = text.trim();
        let inner = inner
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(inner);

        let mut fields = [0u32; 8];
        let mut count = 0;
        for (idx, part) in inner.split(',').enumerate() {
            if idx >= fields.len() {
                return Err(TimeError::FieldCount(idx + 1));
            }
            fields[idx] = part
                .trim()
                .parse::<u32>()
                .map_err(|_| TimeError::NotANumber(idx))?;
            count = idx + 1;
        }

        let [year, month, day, hour, minute, second] = match count {
            6 => [fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]],
            7 | 8 => {
                check("weekday", fields[3], 0, 6)?;
                [fields[0], fields[1], fields[2], fields[4], fields[5], fields[6]]
            }
            _ => return Err(TimeError::FieldCount(count)),
        };

        check("year", year, 0, u16::MAX as u32)?;
        check("month", month, 1, 12)?;
        check("hour", hour, 0, 23)?;
        check("minute", minute, 0, 59)?;
        check("second", second, 0, 59)?;

        Self::new(
            year as u16,
            month as u8,
            day.min(u8::MAX as u32) as u8,
            hour as u8,
            minute as u8,
            second as u8,
        )
    }

    pub fn parse_wire_bytes(bytes: &[u8]) -> Result<Self, TimeError> {
        let text = core::str::from_utf8(bytes).map_err(|_| TimeError::Encoding)?;
        Self::parse_wire(text)
    }
}

/// `YYYY-MM-DD hh:mm:ss`, the timestamp format of every log line and record.
impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Wall-clock capability: the node's real-time clock.
pub trait Clock {
    fn now(&mut self) -> DateTime;

    /// Apply a corrected time (from the time authority).
    fn set(&mut self, time: DateTime);
}

impl<C: Clock + ?Sized> Clock for &mut C {
    fn now(&mut self) -> DateTime {
        (**self).now()
    }

    fn set(&mut self, time: DateTime) {
        (**self).set(time)
    }
}

fn check(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), TimeError> {
    if value < min || value > max {
        return Err(TimeError::OutOfRange { field, value });
    }
    Ok(())
}

pub const fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

// 1970-01-01 was a Thursday (3 with Monday = 0).
fn weekday_from_days(days: i64) -> u8 {
    (days + 3).rem_euclid(7) as u8
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = ((month + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let t = DateTime::new(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(t.to_string(), "2024-01-01 00:00:00");

        let t = DateTime::new(2023, 5, 29, 7, 11, 1).unwrap();
        assert_eq!(t.to_string(), "2023-05-29 07:11:01");
    }

    #[test]
    fn test_weekday_is_derived() {
        // 2024-01-01 was a Monday, 2023-05-29 a Monday, 2000-02-29 a Tuesday
        assert_eq!(DateTime::new(2024, 1, 1, 0, 0, 0).unwrap().weekday, 0);
        assert_eq!(DateTime::new(2023, 5, 29, 0, 0, 0).unwrap().weekday, 0);
        assert_eq!(DateTime::new(2000, 2, 29, 0, 0, 0).unwrap().weekday, 1);
    }

    #[test]
    fn test_wire_tuple_matches_rtc_order() {
        let t = DateTime::new(2024, 3, 9, 14, 5, 59).unwrap();
        assert_eq!(t.to_wire().as_str(), "(2024, 3, 9, 5, 14, 5, 59, 0)");
        assert_eq!(DateTime::parse_wire(&t.to_wire()).unwrap(), t);
    }

    #[test]
    fn test_parse_accepts_seven_fields_without_parens() {
        let t = DateTime::parse_wire("2024,1,1,0,12,30,0").unwrap();
        assert_eq!((t.hour, t.minute, t.second), (12, 30, 0));
    }

    #[test]
    fn test_parse_accepts_six_fields_without_weekday() {
        let t = DateTime::parse_wire("(2024, 6, 1, 12, 0, 30)").unwrap();
        assert_eq!(t.to_string(), "2024-06-01 12:00:30");
        assert_eq!(t.weekday, 5);
        assert!(matches!(
            DateTime::parse_wire("(2024, 6, 1, 24, 0, 30)"),
            Err(TimeError::OutOfRange { field: "hour", .. })
        ));
    }

    #[test]
    fn test_parse_recomputes_weekday() {
        let t = DateTime::parse_wire("(2024, 1, 1, 6, 0, 0, 0, 0)").unwrap();
        assert_eq!(t.weekday, 0);
    }

    #[test]
    fn test_parse_rejects_code_and_garbage() {
        assert!(matches!(
            DateTime::parse_wire("__import__('os').system('x')"),
            Err(TimeError::NotANumber(0))
        ));
        assert_eq!(DateTime::parse_wire("(2024, 1, 1)"), Err(TimeError::FieldCount(3)));
        assert_eq!(
            DateTime::parse_wire("(2024, 1, 1, 0, 0)"),
            Err(TimeError::FieldCount(5))
        );
        assert_eq!(
            DateTime::parse_wire("(2024, 1, 1, 0, 0, 0, 0, 0, 0)"),
            Err(TimeError::FieldCount(9))
        );
        assert_eq!(
            DateTime::parse_wire("(2024, 1, 1, 0, 0, -1, 0, 0)"),
            Err(TimeError::NotANumber(5))
        );
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(matches!(
            DateTime::parse_wire("(2024, 13, 1, 0, 0, 0, 0, 0)"),
            Err(TimeError::OutOfRange { field: "month", .. })
        ));
        assert!(matches!(
            DateTime::parse_wire("(2023, 2, 29, 0, 0, 0, 0, 0)"),
            Err(TimeError::OutOfRange { field: "day", .. })
        ));
        assert!(matches!(
            DateTime::parse_wire("(2024, 1, 1, 0, 24, 0, 0, 0)"),
            Err(TimeError::OutOfRange { field: "hour", .. })
        ));
    }

    #[test]
    fn test_unix_conversion() {
        assert_eq!(DateTime::from_unix(0).to_string(), "1970-01-01 00:00:00");
        let t = DateTime::new(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(t.to_unix(), 1_709_251_199);
        assert_eq!(DateTime::from_unix(t.to_unix()), t);
        assert_eq!(DateTime::from_unix(t.to_unix() + 1).to_string(), "2024-03-01 00:00:00");
    }
}
