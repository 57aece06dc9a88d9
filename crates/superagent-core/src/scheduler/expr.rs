//! Cron expression normalization and evaluation
//!
//! Accepted forms:
//! - 6 fields: `second minute hour day month weekday`
//! - 5 fields: `minute hour day month weekday`, fired at second 0
//! - aliases: `@minutely @hourly @daily @weekly @monthly @yearly @annually`
//!
//! Numeric weekdays use standard cron numbering (0 or 7 = Sunday) and are
//! translated to the `cron` crate's 1 = Sunday numbering. When both day of
//! month and weekday are restricted, either one matching fires the job.
//!
//! Schedules are evaluated in the host's local time zone; fire times are
//! reported in UTC.

use chrono::{DateTime, Local, TimeZone, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// Seconds-first six-field forms
const ALIASES: &[(&str, &str)] = &[
    ("@minutely", "0 * * * * *"),
    ("@hourly", "0 0 * * * *"),
    ("@daily", "0 0 0 * * *"),
    ("@weekly", "0 0 0 * * SUN"),
    ("@monthly", "0 0 0 1 * *"),
    ("@yearly", "0 0 0 1 1 *"),
    ("@annually", "0 0 0 1 1 *"),
];

/// A validated cron schedule
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    normalized: String,
    /// One schedule, or two when day of month and weekday are ORed
    schedules: Vec<cron::Schedule>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr)?;
        let build = |fields: &str| {
            cron::Schedule::from_str(fields).map_err(|e| Error::invalid_cron(expr, e.to_string()))
        };

        let fields: Vec<&str> = normalized.split(' ').collect();
        let restricted = |field: &str| field != "*" && field != "?";
        let schedules = if restricted(fields[3]) && restricted(fields[5]) {
            let mut by_day = fields.clone();
            by_day[5] = "*";
            let mut by_weekday = fields.clone();
            by_weekday[3] = "*";
            vec![build(&by_day.join(" "))?, build(&by_weekday.join(" "))?]
        } else {
            vec![build(&normalized)?]
        };

        Ok(Self {
            source: expr.trim().to_string(),
            normalized,
            schedules,
        })
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Six-field form handed to the scheduling library
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// First fire time strictly after `after`, evaluated in local time
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_in(&after.with_timezone(&Local))
            .map(|t| t.with_timezone(&Utc))
    }

    /// First fire time strictly after `after`, evaluated in `after`'s zone
    pub fn next_after_in<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }

    /// Delay from `now` to the next fire, never below `min_delay`
    pub fn next_delay(&self, now: DateTime<Utc>, min_delay: Duration) -> Result<Duration> {
        let next = self
            .next_after(now)
            .ok_or_else(|| Error::invalid_cron(&self.source, "no upcoming fire time"))?;
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        Ok(delay.max(min_delay))
    }

    /// The next `count` fire times after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            let Some(next) = self.next_after(cursor) else { break };
            times.push(next);
            cursor = next;
        }
        times
    }
}

/// The next `count` fire times of `expr` from now
pub fn next_run_times(expr: &str, count: usize) -> Result<Vec<DateTime<Utc>>> {
    Ok(CronExpr::parse(expr)?.upcoming(Utc::now(), count))
}

/// Rewrite any accepted form into the six-field form
pub fn normalize(expr: &str) -> Result<String> {
    let trimmed = expr.trim();

    if trimmed.starts_with('@') {
        let alias = trimmed.to_ascii_lowercase();
        return ALIASES
            .iter()
            .find(|(name, _)| *name == alias)
            .map(|(_, canonical)| canonical.to_string())
            .ok_or_else(|| Error::invalid_cron(expr, "unknown alias"));
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => {
            return Err(Error::invalid_cron(
                expr,
                format!("expected 5 or 6 fields, got {}", n),
            ));
        }
    }

    fields[5] = translate_weekdays(&fields[5], expr)?;
    Ok(fields.join(" "))
}

/// Map standard weekday numbers (0-7, Sunday = 0 or 7) onto 1-7 (Sunday = 1)
fn translate_weekdays(field: &str, expr: &str) -> Result<String> {
    let parts = field
        .split(',')
        .map(|part| translate_weekday_part(part, expr))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(","))
}

fn translate_weekday_part(part: &str, expr: &str) -> Result<String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };

    // Names, wildcards and anything non-numeric pass through
    if !range.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Ok(part.to_string());
    }

    let day = |s: &str| -> Result<u32> {
        match s.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(n),
            _ => Err(Error::invalid_cron(expr, format!("invalid weekday '{}'", s))),
        }
    };
    let shift = |n: u32| n % 7 + 1;

    let Some(step) = step else {
        return match range.split_once('-') {
            None => Ok(shift(day(range)?).to_string()),
            Some((start, end)) => {
                let (start, end) = (day(start)?, day(end)?);
                if end == 7 {
                    // Runs through Sunday, which now sits at the front of the week
                    return Ok(match start {
                        0 | 7 => "1-7".to_string(),
                        s => format!("{}-7,1", shift(s)),
                    });
                }
                Ok(format!("{}-{}", shift(start), shift(end)))
            }
        };
    };

    // Stepped: list the days, since renumbering breaks up the range
    let step = match step.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => return Err(Error::invalid_cron(expr, format!("invalid weekday step '{}'", step))),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (day(start)?, day(end)?),
        // `n/step` runs from n to the end of the week
        None => (day(range)?, 7),
    };
    let mut days: Vec<u32> = (start..=end).step_by(step).map(shift).collect();
    if days.is_empty() {
        return Err(Error::invalid_cron(expr, format!("empty weekday range '{}'", part)));
    }
    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, FixedOffset, Timelike, Weekday};

    #[test]
    fn test_aliases() {
        assert_eq!(normalize("@hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize("@minutely").unwrap(), "0 * * * * *");
        assert_eq!(normalize("@daily").unwrap(), "0 0 0 * * *");
        assert_eq!(normalize("@ANNUALLY").unwrap(), normalize("@yearly").unwrap());
        assert!(matches!(
            normalize("@fortnightly"),
            Err(Error::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_field_counts() {
        assert_eq!(normalize("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize("*/20 * * * * *").unwrap(), "*/20 * * * * *");
        assert!(normalize("* * * *").is_err());
        assert!(normalize("* * * * * * *").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn test_weekday_translation() {
        assert_eq!(normalize("0 0 * * 0").unwrap(), "0 0 0 * * 1");
        assert_eq!(normalize("0 0 * * 7").unwrap(), "0 0 0 * * 1");
        assert_eq!(normalize("0 9 * * 1-5").unwrap(), "0 0 9 * * 2-6");
        assert_eq!(normalize("0 9 * * 5-7").unwrap(), "0 0 9 * * 6-7,1");
        assert_eq!(normalize("0 9 * * 1,3").unwrap(), "0 0 9 * * 2,4");
        assert_eq!(normalize("0 15 10 * * MON-FRI").unwrap(), "0 15 10 * * MON-FRI");
        assert!(normalize("0 0 * * 9").is_err());

        // Stepped ranges keep Sunday when they run to 7
        assert_eq!(normalize("0 0 * * 3-7/2").unwrap(), "0 0 0 * * 1,4,6");
        assert_eq!(normalize("0 0 * * 1/2").unwrap(), "0 0 0 * * 1,2,4,6");
        assert_eq!(normalize("0 0 * * 1-5/2").unwrap(), "0 0 0 * * 2,4,6");
        assert!(normalize("0 0 * * 1-5/0").is_err());
        assert!(normalize("0 0 * * 5-1/2").is_err());
    }

    #[test]
    fn test_sunday_schedule_fires_on_sunday() {
        let expr = CronExpr::parse("30 8 * * 0").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        for fire in expr.upcoming(start, 3) {
            let local = fire.with_timezone(&Local);
            assert_eq!(local.weekday(), Weekday::Sun);
            assert_eq!((local.hour(), local.minute(), local.second()), (8, 30, 0));
        }
    }

    #[test]
    fn test_stepped_range_through_sunday_fires_on_sunday() {
        let expr = CronExpr::parse("0 0 * * 3-7/2").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let days: Vec<_> = (0..3)
            .scan(start, |cursor, _| {
                let next = expr.next_after_in(cursor)?;
                *cursor = next;
                Some(next.weekday())
            })
            .collect();
        assert_eq!(days, vec![Weekday::Wed, Weekday::Fri, Weekday::Sun]);
    }

    #[test]
    fn test_hourly_fires_at_top_of_hour() {
        let expr = CronExpr::parse("@hourly").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 17, 42).unwrap();
        let next = expr.next_after_in(&now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_evaluated_in_local_time() {
        let expr = CronExpr::parse("@daily").unwrap();
        let next = expr.next_after(Utc::now()).unwrap().with_timezone(&Local);
        assert_eq!((next.hour(), next.minute(), next.second()), (0, 0, 0));

        // Wall-clock fields follow the zone the evaluation runs in
        let plus_five = FixedOffset::east_opt(5 * 3600).unwrap();
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let start = plus_five.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = expr.next_after_in(&start).unwrap();
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 5, 2, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_day_of_month_or_weekday() {
        // The 1st of the month or any Monday
        let expr = CronExpr::parse("0 0 1 * 1").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(
            expr.next_after_in(&after),
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap())
        );
        let after = Utc.with_ymd_and_hms(2024, 1, 29, 0, 0, 1).unwrap();
        assert_eq!(
            expr.next_after_in(&after),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );

        // A wildcard on either side leaves the other in charge
        let monthly = CronExpr::parse("0 0 1 * *").unwrap();
        assert_eq!(
            monthly.next_after_in(&Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_delay_bounds() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let min = Duration::from_millis(100);
        let delay = expr.next_delay(Utc::now(), min).unwrap();
        assert!(delay >= min);
        assert!(delay <= Duration::from_secs(300));
    }

    #[test]
    fn test_next_delay_floor() {
        let expr = CronExpr::parse("0 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 59).unwrap()
            + chrono::Duration::milliseconds(950);
        let delay = expr.next_delay(now, Duration::from_millis(100)).unwrap();
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn test_next_run_times_count() {
        let times = next_run_times("0 0 * * * *", 4).unwrap();
        assert_eq!(times.len(), 4);
        assert!(times.windows(2).all(|pair| pair[0] < pair[1]));
        for time in times.iter().map(|t| t.with_timezone(&Local)) {
            assert_eq!((time.minute(), time.second()), (0, 0));
        }
    }
}
