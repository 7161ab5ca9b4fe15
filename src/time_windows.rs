//! Calendar-aligned cycle arithmetic.
//!
//! Every interval is half-open, `begin <= ts < end`, and aligned to the
//! calendar of the supplied time zone. Consecutive intervals of the same cycle
//! type are contiguous: the next interval begins exactly where the previous
//! one ends.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("unsupported cycle type: {0}")]
    UnsupportedCycle(String),
    #[error("timestamp {0} is outside the representable range")]
    OutOfRange(i64),
    #[error("local time {0} cannot be resolved in this time zone")]
    InvalidLocalTime(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleType {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl CycleType {
    pub const ALL: [CycleType; 6] = [
        CycleType::Hour,
        CycleType::Day,
        CycleType::Week,
        CycleType::Month,
        CycleType::Quarter,
        CycleType::Year,
    ];

    /// Legacy numeric task codes: 1 year, 2 quarter, 3 month, 4 week, 5 day, 6 hour.
    pub fn from_code(code: u8) -> Result<Self, CycleError> {
        match code {
            1 => Ok(CycleType::Year),
            2 => Ok(CycleType::Quarter),
            3 => Ok(CycleType::Month),
            4 => Ok(CycleType::Week),
            5 => Ok(CycleType::Day),
            6 => Ok(CycleType::Hour),
            other => Err(CycleError::UnsupportedCycle(other.to_string())),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            CycleType::Year => 1,
            CycleType::Quarter => 2,
            CycleType::Month => 3,
            CycleType::Week => 4,
            CycleType::Day => 5,
            CycleType::Hour => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CycleType::Hour => "hour",
            CycleType::Day => "day",
            CycleType::Week => "week",
            CycleType::Month => "month",
            CycleType::Quarter => "quarter",
            CycleType::Year => "year",
        }
    }
}

impl fmt::Display for CycleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleType {
    type Err = CycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u8>() {
            return Self::from_code(code);
        }
        CycleType::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CycleError::UnsupportedCycle(trimmed.to_string()))
    }
}

/// Unix-second bounds of one cycle, `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub begin: i64,
    pub end: i64,
}

impl Interval {
    pub fn contains(&self, ts: i64) -> bool {
        self.begin <= ts && ts < self.end
    }

    pub fn len_secs(&self) -> i64 {
        self.end - self.begin
    }
}

/// Interval of `cycle` containing `ts`, in the process-local time zone.
pub fn interval(ts: i64, cycle: CycleType) -> Result<Interval, CycleError> {
    interval_in(&Local, ts, cycle)
}

pub fn interval_in<Tz: TimeZone>(tz: &Tz, ts: i64, cycle: CycleType) -> Result<Interval, CycleError> {
    let at: DateTime<Tz> = tz
        .timestamp_opt(ts, 0)
        .single()
        .ok_or(CycleError::OutOfRange(ts))?;
    let date = at.date_naive();

    let (start, end) = match cycle {
        CycleType::Hour => {
            let start = midnight(date)
                .checked_add_signed(ChronoDuration::hours(i64::from(at.hour())))
                .ok_or(CycleError::OutOfRange(ts))?;
            let end = start
                .checked_add_signed(ChronoDuration::hours(1))
                .ok_or(CycleError::OutOfRange(ts))?;
            (start, end)
        }
        CycleType::Day => {
            let next = date.succ_opt().ok_or(CycleError::OutOfRange(ts))?;
            (midnight(date), midnight(next))
        }
        CycleType::Week => {
            let back = i64::from(date.weekday().num_days_from_monday());
            let monday = date
                .checked_sub_signed(ChronoDuration::days(back))
                .ok_or(CycleError::OutOfRange(ts))?;
            let next = monday
                .checked_add_signed(ChronoDuration::days(7))
                .ok_or(CycleError::OutOfRange(ts))?;
            (midnight(monday), midnight(next))
        }
        CycleType::Month => month_span(date.year(), date.month(), 1, ts)?,
        CycleType::Quarter => {
            let first_month = (date.month0() / 3) * 3 + 1;
            month_span(date.year(), first_month, 3, ts)?
        }
        CycleType::Year => month_span(date.year(), 1, 12, ts)?,
    };

    Ok(Interval {
        begin: resolve_local(tz, start)?,
        end: resolve_local(tz, end)?,
    })
}

/// Start of the local day containing `ts`.
pub fn day_start(ts: i64) -> Result<i64, CycleError> {
    interval(ts, CycleType::Day).map(|i| i.begin)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::default())
}

fn month_span(
    year: i32,
    month: u32,
    months: u32,
    ts: i64,
) -> Result<(NaiveDateTime, NaiveDateTime), CycleError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(CycleError::OutOfRange(ts))?;
    let next = first
        .checked_add_months(Months::new(months))
        .ok_or(CycleError::OutOfRange(ts))?;
    Ok((midnight(first), midnight(next)))
}

/// Boundaries that fall into a DST gap move forward to the first valid instant.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Result<i64, CycleError> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Ok(dt.timestamp());
    }
    let mut probe = naive;
    for _ in 0..4 {
        probe = probe
            .checked_add_signed(ChronoDuration::minutes(30))
            .ok_or(CycleError::InvalidLocalTime(naive))?;
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return Ok(dt.timestamp());
        }
    }
    Err(CycleError::InvalidLocalTime(naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn parses_names_and_codes() {
        assert_eq!("week".parse::<CycleType>().unwrap(), CycleType::Week);
        assert_eq!("Quarter".parse::<CycleType>().unwrap(), CycleType::Quarter);
        assert_eq!("4".parse::<CycleType>().unwrap(), CycleType::Week);
        assert!(matches!(
            "7".parse::<CycleType>(),
            Err(CycleError::UnsupportedCycle(_))
        ));
        assert!(matches!(
            "fortnight".parse::<CycleType>(),
            Err(CycleError::UnsupportedCycle(_))
        ));
    }

    #[test]
    fn codes_round_trip() {
        for cycle in CycleType::ALL {
            assert_eq!(CycleType::from_code(cycle.code()).unwrap(), cycle);
        }
    }

    #[test]
    fn hour_in_half_hour_offset_zone() {
        let tz = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let at = tz.with_ymd_and_hms(2024, 3, 10, 14, 45, 10).unwrap();
        let i = interval_in(&tz, at.timestamp(), CycleType::Hour).unwrap();
        assert_eq!(i.begin, tz.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap().timestamp());
        assert_eq!(i.len_secs(), 3600);
    }

    #[test]
    fn december_rolls_into_next_year() {
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let month = interval_in(&Utc, at.timestamp(), CycleType::Month).unwrap();
        assert_eq!(month.end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp());
        let quarter = interval_in(&Utc, at.timestamp(), CycleType::Quarter).unwrap();
        assert_eq!(quarter.begin, Utc.with_ymd_and_hms(2023, 10, 1, 0, 0, 0).unwrap().timestamp());
    }
}
