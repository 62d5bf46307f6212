//! Five-field cron expressions.
//! Fields: "MIN HOUR DOM MON DOW", evaluated in UTC.
//! Each field accepts `*`, `N`, `a-b`, `*/N`, `a-b/N` and comma lists of those.
//! Day-of-week is 0-7 with both 0 and 7 meaning Sunday.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! either does; when one is `*` only the other applies.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::{fmt, str::FromStr};

/// Parsed cron schedule; each field is a bitmask of allowed values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let invalid = |reason: String| EngineError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (MIN HOUR DOM MON DOW), got {}",
                parts.len()
            )));
        }

        let minutes = parse_field(parts[0], 0, 59).map_err(|e| invalid(format!("minute: {e}")))?;
        let hours = parse_field(parts[1], 0, 23).map_err(|e| invalid(format!("hour: {e}")))?;
        let days_of_month =
            parse_field(parts[2], 1, 31).map_err(|e| invalid(format!("day-of-month: {e}")))?;
        let months = parse_field(parts[3], 1, 12).map_err(|e| invalid(format!("month: {e}")))?;
        let mut days_of_week =
            parse_field(parts[4], 0, 7).map_err(|e| invalid(format!("day-of-week: {e}")))?;

        // 7 is Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: parts.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            // a field starting with '*' (including "*/N") counts as unrestricted
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the minute containing `at` is a firing boundary
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        bit(self.minutes, at.minute())
            && bit(self.hours, at.hour())
            && bit(self.months, at.month())
            && self.day_matches(at.date_naive())
    }

    /// First firing boundary strictly after `after`
    ///
    /// Returns `None` for expressions that can never fire (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
        let horizon = after.year() + 5;

        while candidate.year() <= horizon {
            if !bit(self.months, candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate.date_naive()) {
                candidate = start_of_day(candidate.date_naive().succ_opt()?);
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = truncate_to_minute(candidate) + Duration::minutes(60 - candidate.minute() as i64);
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Floor to the start of the minute
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(at)
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).map(start_of_day)
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    let mut mask = 0u64;
    for item in field.split(',') {
        mask |= parse_item(item, min, max)?;
    }
    Ok(mask)
}

fn parse_item(item: &str, min: u32, max: u32) -> Result<u64, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step '{step}'"))?;
            if step == 0 {
                return Err("step must be positive".to_string());
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, min, max)?, parse_value(b, min, max)?)
    } else {
        let n = parse_value(range, min, max)?;
        // "N/step" runs from N to the end of the range
        if step > 1 {
            (n, max)
        } else {
            (n, n)
        }
    };

    if start > end {
        return Err(format!("range {start}-{end} is reversed"));
    }

    Ok((start..=end)
        .step_by(step as usize)
        .fold(0u64, |mask, v| mask | (1u64 << v)))
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if n < min || n > max {
        return Err(format!("{n} outside {min}-{max}"));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_at_two_fires_once_per_day_over_48_hours() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        let start = at(2026, 3, 1, 0, 0);
        let fires: Vec<_> = (0..48 * 60)
            .map(|m| start + Duration::minutes(m))
            .filter(|t| cron.matches(*t))
            .collect();

        assert_eq!(fires, vec![at(2026, 3, 1, 2, 0), at(2026, 3, 2, 2, 0)]);
        assert!(!cron.matches(at(2026, 3, 1, 2, 1)));
        assert!(!cron.matches(at(2026, 3, 1, 1, 59)));
    }

    #[test]
    fn steps_ranges_and_lists() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // 2026-02-23 is a Monday
        assert!(cron.matches(at(2026, 2, 23, 9, 45)));
        assert!(!cron.matches(at(2026, 2, 23, 9, 50)));
        assert!(!cron.matches(at(2026, 2, 22, 10, 0)));

        let cron = CronSchedule::parse("5,10 0 1 1,7 *").unwrap();
        assert!(cron.matches(at(2026, 7, 1, 0, 10)));
        assert!(!cron.matches(at(2026, 6, 1, 0, 10)));

        let cron = CronSchedule::parse("10-30/10 * * * *").unwrap();
        let minutes: Vec<u32> = (0..60).filter(|m| cron.matches(at(2026, 1, 1, 0, *m))).collect();
        assert_eq!(minutes, vec![10, 20, 30]);
    }

    #[test]
    fn day_of_month_and_week_are_ored_when_both_restricted() {
        // 1st of the month OR any Sunday
        let cron = CronSchedule::parse("0 0 1 * 7").unwrap();
        assert!(cron.matches(at(2026, 3, 1, 0, 0)));
        // 2026-03-08 is a Sunday
        assert!(cron.matches(at(2026, 3, 8, 0, 0)));
        assert!(!cron.matches(at(2026, 3, 9, 0, 0)));

        // only day-of-week restricted: Sundays only
        let cron = CronSchedule::parse("0 0 * * 0").unwrap();
        assert!(cron.matches(at(2026, 3, 8, 0, 0)));
        assert!(!cron.matches(at(2026, 3, 1, 12, 0)));
        assert!(!cron.matches(at(2026, 3, 2, 0, 0)));
    }

    #[test]
    fn starred_step_day_field_is_anded_with_the_other() {
        // odd days of the month that are also Mondays
        let schedule = CronSchedule::parse("0 0 */2 * 1").unwrap();
        // 2026-03-09 is a Monday, 2026-03-02 a Monday on an even day
        assert!(schedule.matches(at(2026, 3, 9, 0, 0)));
        assert!(!schedule.matches(at(2026, 3, 2, 0, 0)));
        assert!(!schedule.matches(at(2026, 3, 3, 0, 0)));

        // the 15th, and only on Sun/Tue/Thu/Sat; 2026-03-15 is a Sunday
        let schedule = CronSchedule::parse("0 0 15 * */2").unwrap();
        assert!(schedule.matches(at(2026, 3, 15, 0, 0)));
        assert!(!schedule.matches(at(2026, 3, 17, 0, 0)));
    }

    #[test]
    fn next_after_skips_to_following_boundary() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 3, 1, 2, 0)), Some(at(2026, 3, 2, 2, 0)));
        assert_eq!(cron.next_after(at(2026, 3, 1, 1, 59)), Some(at(2026, 3, 1, 2, 0)));

        let yearly = CronSchedule::parse("0 0 1 1 *").unwrap();
        assert_eq!(yearly.next_after(at(2026, 6, 15, 8, 0)), Some(at(2027, 1, 1, 0, 0)));

        let never = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(never.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(matches!(err, EngineError::InvalidCron { .. }), "{bad}");
        }
    }
}
