//! Cron schedule validation and local-time conversion
//!
//! The engine validates and emits `schedule` expressions; triggering them is
//! the job of an external scheduler. The [`LocalScheduler`] converts local
//! wall-clock times in a fixed-offset timezone into UTC cron expressions for
//! deployment targets that only understand UTC.

use crate::error::{FlowError, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Months, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static MINUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\*|[0-5]?\d|[0-5]?\d-[0-5]?\d|\*/\d+)$").expect("minute regex"));
static HOUR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*|[01]?\d|2[0-3]|[01]?\d-[01]?\d|2[0-3]-2[0-3]|\*/\d+)$").expect("hour regex")
});
static LOCAL_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("local time regex"));

/// Validate a cron expression with 5 or 6 fields.
///
/// The minute and hour fields are checked against strict grammars (literal,
/// range, or step); the remaining fields are accepted lexically.
///
/// # Example
///
/// ```
/// use apiflow::schedule::validate_cron;
///
/// assert!(validate_cron("0 18 * * *").is_ok());
/// assert!(validate_cron("not a cron").is_err());
/// ```
pub fn validate_cron(expression: &str) -> Result<()> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(FlowError::Validation(format!(
            "Cron schedule must have 5 or 6 fields, got {}",
            fields.len()
        )));
    }
    if !MINUTE_RE.is_match(fields[0]) {
        return Err(FlowError::Validation(format!(
            "Invalid minute field '{}' in cron schedule",
            fields[0]
        )));
    }
    if !HOUR_RE.is_match(fields[1]) {
        return Err(FlowError::Validation(format!(
            "Invalid hour field '{}' in cron schedule",
            fields[1]
        )));
    }
    Ok(())
}

/// Schedule frequency for local-time conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Converts local wall-clock schedules in a fixed-offset timezone to UTC.
#[derive(Debug, Clone, Copy)]
pub struct LocalScheduler {
    /// Hours east of UTC (e.g. 8 for Singapore)
    pub offset_hours: i32,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        // UTC+8, no DST
        Self { offset_hours: 8 }
    }
}

impl LocalScheduler {
    pub fn new(offset_hours: i32) -> Result<Self> {
        if !(-12..=14).contains(&offset_hours) {
            return Err(FlowError::Validation(format!(
                "UTC offset must be between -12 and +14 hours, got {offset_hours}"
            )));
        }
        Ok(Self { offset_hours })
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.offset_hours * 3600).expect("offset validated in constructor")
    }

    /// Parse a `HH:MM` local time.
    pub fn parse_local_time(&self, local_time: &str) -> Result<(u32, u32)> {
        let captures = LOCAL_TIME_RE.captures(local_time).ok_or_else(|| {
            FlowError::Validation(format!(
                "Local time must be in HH:MM format, got '{local_time}'"
            ))
        })?;
        let hour = captures[1].parse().expect("hour checked by regex");
        let minute = captures[2].parse().expect("minute checked by regex");
        Ok((hour, minute))
    }

    /// Convert a local time to a UTC cron expression.
    ///
    /// Weekly schedules require a `weekday` name; monthly schedules require a
    /// `day_of_month` (1-31).
    pub fn to_utc_cron(
        &self,
        local_time: &str,
        frequency: Frequency,
        weekday: Option<&str>,
        day_of_month: Option<u32>,
    ) -> Result<String> {
        let (local_hour, minute) = self.parse_local_time(local_time)?;
        let utc_hour = (local_hour as i32 - self.offset_hours).rem_euclid(24);

        match frequency {
            Frequency::Daily => Ok(format!("{minute} {utc_hour} * * *")),
            Frequency::Weekly => {
                let weekday = weekday.ok_or_else(|| {
                    FlowError::Validation("weekday is required for weekly schedules".to_string())
                })?;
                let weekday_num = weekday_to_cron_num(weekday)?;
                Ok(format!("{minute} {utc_hour} * * {weekday_num}"))
            }
            Frequency::Monthly => {
                let day = day_of_month.ok_or_else(|| {
                    FlowError::Validation(
                        "day_of_month is required for monthly schedules".to_string(),
                    )
                })?;
                if !(1..=31).contains(&day) {
                    return Err(FlowError::Validation(format!(
                        "day_of_month must be between 1 and 31, got {day}"
                    )));
                }
                Ok(format!("{minute} {utc_hour} {day} * *"))
            }
        }
    }

    /// Next occurrence of a local time, in the scheduler's timezone.
    pub fn next_occurrence(
        &self,
        local_time: &str,
        frequency: Frequency,
    ) -> Result<DateTime<FixedOffset>> {
        let (hour, minute) = self.parse_local_time(local_time)?;
        let now = Utc::now().with_timezone(&self.offset());
        let target = now
            .with_hour(hour)
            .and_then(|t| t.with_minute(minute))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| {
                FlowError::Validation(format!("Invalid local time '{local_time}'"))
            })?;

        if target > now {
            return Ok(target);
        }
        let next = match frequency {
            Frequency::Daily => target + ChronoDuration::days(1),
            Frequency::Weekly => target + ChronoDuration::days(7),
            Frequency::Monthly => target
                .checked_add_months(Months::new(1))
                .ok_or_else(|| FlowError::Validation("Date overflow".to_string()))?,
        };
        Ok(next)
    }
}

fn weekday_to_cron_num(weekday: &str) -> Result<u32> {
    match weekday.to_lowercase().as_str() {
        "sunday" => Ok(0),
        "monday" => Ok(1),
        "tuesday" => Ok(2),
        "wednesday" => Ok(3),
        "thursday" => Ok(4),
        "friday" => Ok(5),
        "saturday" => Ok(6),
        other => Err(FlowError::Validation(format!(
            "Unknown weekday '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cron_field_counts() {
        assert!(validate_cron("0 18 * * *").is_ok());
        assert!(validate_cron("0 0 2 * * *").is_ok());
        assert!(validate_cron("0 18 * *").is_err());
        assert!(validate_cron("0 18 * * * * *").is_err());
    }

    #[test]
    fn test_validate_cron_minute_field() {
        assert!(validate_cron("* * * * *").is_ok());
        assert!(validate_cron("59 * * * *").is_ok());
        assert!(validate_cron("0-30 * * * *").is_ok());
        assert!(validate_cron("*/15 * * * *").is_ok());
        assert!(validate_cron("60 * * * *").is_err());
        assert!(validate_cron("abc * * * *").is_err());
    }

    #[test]
    fn test_validate_cron_hour_field() {
        assert!(validate_cron("0 23 * * *").is_ok());
        assert!(validate_cron("0 9-17 * * *").is_ok());
        assert!(validate_cron("0 */2 * * *").is_ok());
        assert!(validate_cron("0 24 * * *").is_err());
    }

    #[test]
    fn test_daily_conversion_crossing_midnight() {
        // 02:00 at UTC+8 is 18:00 UTC the previous day
        let scheduler = LocalScheduler::default();
        let cron = scheduler
            .to_utc_cron("02:00", Frequency::Daily, None, None)
            .unwrap();
        assert_eq!(cron, "0 18 * * *");
    }

    #[test]
    fn test_daily_conversion_same_day() {
        let scheduler = LocalScheduler::default();
        let cron = scheduler
            .to_utc_cron("14:30", Frequency::Daily, None, None)
            .unwrap();
        assert_eq!(cron, "30 6 * * *");
    }

    #[test]
    fn test_weekly_and_monthly_conversion() {
        let scheduler = LocalScheduler::default();
        let cron = scheduler
            .to_utc_cron("10:00", Frequency::Weekly, Some("monday"), None)
            .unwrap();
        assert_eq!(cron, "0 2 * * 1");

        let cron = scheduler
            .to_utc_cron("10:00", Frequency::Monthly, None, Some(15))
            .unwrap();
        assert_eq!(cron, "0 2 15 * *");

        assert!(scheduler
            .to_utc_cron("10:00", Frequency::Weekly, None, None)
            .is_err());
        assert!(scheduler
            .to_utc_cron("10:00", Frequency::Monthly, None, Some(0))
            .is_err());
    }

    #[test]
    fn test_negative_offset_conversion() {
        // 20:00 at UTC-5 is 01:00 UTC the next day
        let scheduler = LocalScheduler::new(-5).unwrap();
        let cron = scheduler
            .to_utc_cron("20:00", Frequency::Daily, None, None)
            .unwrap();
        assert_eq!(cron, "0 1 * * *");
    }

    #[test]
    fn test_local_time_validation() {
        let scheduler = LocalScheduler::default();
        assert!(scheduler.parse_local_time("00:00").is_ok());
        assert!(scheduler.parse_local_time("23:59").is_ok());
        assert!(scheduler.parse_local_time("24:00").is_err());
        assert!(scheduler.parse_local_time("9:5").is_err());
        assert!(scheduler.parse_local_time("nope").is_err());
    }

    #[test]
    fn test_next_occurrence_is_in_future() {
        let scheduler = LocalScheduler::default();
        let next = scheduler
            .next_occurrence("12:00", Frequency::Daily)
            .unwrap();
        let now = Utc::now().with_timezone(&FixedOffset::east_opt(8 * 3600).unwrap());
        assert!(next > now);
        assert_eq!(next.hour(), 12);
        assert_eq!(next.minute(), 0);
        // Never more than one day out for a daily schedule
        assert!(next - now <= ChronoDuration::days(1));
    }

    #[test]
    fn test_offset_bounds() {
        assert!(LocalScheduler::new(14).is_ok());
        assert!(LocalScheduler::new(-12).is_ok());
        assert!(LocalScheduler::new(15).is_err());
    }
}
