//! Recurrence rules and next-run computation.
//!
//! [`Schedule`] is the user-facing, serde-able spec. It is validated and
//! compiled once at job creation ([`Compiled::compile`]); every runtime
//! next-run computation is a pure function of the compiled rule, a reference
//! instant, and the job's timezone.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A wall-clock time of day used by the calendar schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl AtTime {
    pub fn new(hour: u8, minute: u8, second: u8) -> Self {
        Self { hour, minute, second }
    }
}

/// How often a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire every `every` after the previous run. Must be non-zero.
    Interval { every: Duration },
    /// Fire after a uniformly random delay in `[min, max)`. Requires
    /// `0 < min < max`.
    RandomInterval { min: Duration, max: Duration },
    /// Cron expression: 5 fields (minute resolution) when `with_seconds` is
    /// false, 6 fields when true. Parsed at creation, never at runtime.
    Cron { expr: String, with_seconds: bool },
    /// Every `interval` days at each of `at_times`.
    Daily { interval: u32, at_times: Vec<AtTime> },
    /// Every `interval` weeks, on `weekdays`, at each of `at_times`.
    /// Weeks are ISO weeks (Monday-based).
    Weekly {
        interval: u32,
        weekdays: Vec<Weekday>,
        at_times: Vec<AtTime>,
    },
    /// Every `interval` months, on `days` of the month, at each of
    /// `at_times`. Negative days count back from the end of the month
    /// (-1 = last day); 0 is invalid.
    Monthly {
        interval: u32,
        days: Vec<i8>,
        at_times: Vec<AtTime>,
    },
}

impl Schedule {
    pub fn every(every: Duration) -> Self {
        Self::Interval { every }
    }

    pub fn every_random(min: Duration, max: Duration) -> Self {
        Self::RandomInterval { min, max }
    }

    pub fn cron(expr: impl Into<String>, with_seconds: bool) -> Self {
        Self::Cron { expr: expr.into(), with_seconds }
    }

    pub fn daily(interval: u32, at_times: Vec<AtTime>) -> Self {
        Self::Daily { interval, at_times }
    }

    pub fn weekly(interval: u32, weekdays: Vec<Weekday>, at_times: Vec<AtTime>) -> Self {
        Self::Weekly { interval, weekdays, at_times }
    }

    pub fn monthly(interval: u32, days: Vec<i8>, at_times: Vec<AtTime>) -> Self {
        Self::Monthly { interval, days, at_times }
    }
}

/// Upper bound on how many periods (days/weeks/months) a calendar search
/// scans before giving up. Validation guarantees at least one candidate per
/// period cycle, so the bound is never hit in practice.
const MAX_PERIOD_SCAN: u32 = 500;

/// A validated, pre-parsed schedule. Owned by the internal job.
#[derive(Debug, Clone)]
pub(crate) enum Compiled {
    Interval(chrono::Duration),
    Random { min_nanos: u64, max_nanos: u64 },
    Cron(Box<cron::Schedule>),
    Daily { interval: u32, at_times: Vec<AtTime> },
    Weekly {
        interval: u32,
        weekdays: Vec<Weekday>,
        at_times: Vec<AtTime>,
    },
    Monthly {
        interval: u32,
        days: Vec<i8>,
        at_times: Vec<AtTime>,
    },
}

impl Compiled {
    /// Validate a schedule spec and pre-parse whatever can be parsed once.
    pub(crate) fn compile(spec: &Schedule) -> Result<Self, Error> {
        match spec {
            Schedule::Interval { every } => {
                if every.is_zero() {
                    return Err(Error::InvalidSchedule("interval must be non-zero".into()));
                }
                let every = chrono::Duration::from_std(*every)
                    .map_err(|_| Error::InvalidSchedule("interval is too large".into()))?;
                Ok(Self::Interval(every))
            }
            Schedule::RandomInterval { min, max } => {
                if min.is_zero() {
                    return Err(Error::InvalidSchedule("random interval min must be non-zero".into()));
                }
                if min >= max {
                    return Err(Error::InvalidSchedule(
                        "random interval requires min < max".into(),
                    ));
                }
                let max_nanos = u64::try_from(max.as_nanos())
                    .map_err(|_| Error::InvalidSchedule("random interval max is too large".into()))?;
                if max_nanos > i64::MAX as u64 {
                    return Err(Error::InvalidSchedule("random interval max is too large".into()));
                }
                Ok(Self::Random { min_nanos: min.as_nanos() as u64, max_nanos })
            }
            Schedule::Cron { expr, with_seconds } => {
                let fields = expr.split_whitespace().count();
                let expected = if *with_seconds { 6 } else { 5 };
                if fields != expected {
                    return Err(Error::InvalidCronExpression {
                        expr: expr.clone(),
                        reason: format!("expected {expected} fields, got {fields}"),
                    });
                }
                // The cron crate always wants a seconds field; a 5-field
                // expression fires at second zero.
                let normalized = if *with_seconds {
                    expr.clone()
                } else {
                    format!("0 {expr}")
                };
                let parsed = cron::Schedule::from_str(&normalized).map_err(|e| {
                    Error::InvalidCronExpression { expr: expr.clone(), reason: e.to_string() }
                })?;
                Ok(Self::Cron(Box::new(parsed)))
            }
            Schedule::Daily { interval, at_times } => {
                check_interval(*interval)?;
                Ok(Self::Daily { interval: *interval, at_times: normalize_at_times(at_times)? })
            }
            Schedule::Weekly { interval, weekdays, at_times } => {
                check_interval(*interval)?;
                if weekdays.is_empty() {
                    return Err(Error::InvalidSchedule("weekly schedule needs at least one weekday".into()));
                }
                let mut weekdays = weekdays.clone();
                weekdays.sort_by_key(|d| d.num_days_from_monday());
                weekdays.dedup();
                Ok(Self::Weekly {
                    interval: *interval,
                    weekdays,
                    at_times: normalize_at_times(at_times)?,
                })
            }
            Schedule::Monthly { interval, days, at_times } => {
                check_interval(*interval)?;
                if days.is_empty() {
                    return Err(Error::InvalidSchedule("monthly schedule needs at least one day of month".into()));
                }
                let mut days = days.clone();
                for d in &days {
                    if *d == 0 || *d < -31 || *d > 31 {
                        return Err(Error::InvalidSchedule(format!(
                            "day of month {d} out of range (-31..=31, non-zero)"
                        )));
                    }
                }
                days.sort_unstable();
                days.dedup();
                Ok(Self::Monthly {
                    interval: *interval,
                    days,
                    at_times: normalize_at_times(at_times)?,
                })
            }
        }
    }

    /// Compute the next due instant strictly after `reference`, evaluated in
    /// `tz` for the calendar variants. `None` only when the bounded calendar
    /// search is exhausted, which validation rules out for well-formed rules.
    pub(crate) fn next_after(&self, reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => reference.checked_add_signed(*every),
            Self::Random { min_nanos, max_nanos } => {
                let nanos = rand::rng().random_range(*min_nanos..*max_nanos);
                reference.checked_add_signed(chrono::Duration::nanoseconds(nanos as i64))
            }
            Self::Cron(schedule) => {
                let local = reference.with_timezone(&tz);
                schedule.after(&local).next().map(|t| t.with_timezone(&Utc))
            }
            Self::Daily { interval, at_times } => next_daily(*interval, at_times, reference, tz),
            Self::Weekly { interval, weekdays, at_times } => {
                next_weekly(*interval, weekdays, at_times, reference, tz)
            }
            Self::Monthly { interval, days, at_times } => {
                next_monthly(*interval, days, at_times, reference, tz)
            }
        }
    }
}

fn check_interval(interval: u32) -> Result<(), Error> {
    if interval == 0 {
        return Err(Error::InvalidSchedule("calendar interval must be >= 1".into()));
    }
    Ok(())
}

fn normalize_at_times(at_times: &[AtTime]) -> Result<Vec<AtTime>, Error> {
    if at_times.is_empty() {
        return Err(Error::InvalidSchedule("at least one at-time is required".into()));
    }
    for at in at_times {
        if at.hour > 23 || at.minute > 59 || at.second > 59 {
            return Err(Error::InvalidSchedule(format!(
                "at-time {:02}:{:02}:{:02} out of range",
                at.hour, at.minute, at.second
            )));
        }
    }
    let mut sorted = at_times.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(sorted)
}

/// Resolve a civil date + time-of-day in `tz`, applying the DST rules: a gap
/// time is shifted forward one hour and re-resolved; an ambiguous time takes
/// its first occurrence.
fn resolve_local(tz: Tz, date: NaiveDate, at: AtTime) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(at.hour as u32, at.minute as u32, at.second as u32)?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _) => Some(first),
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest(),
    }
}

fn next_daily(
    interval: u32,
    at_times: &[AtTime],
    reference: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let start = reference.with_timezone(&tz).date_naive();
    for step in 0..MAX_PERIOD_SCAN {
        let date = start.checked_add_days(Days::new(interval as u64 * step as u64))?;
        for at in at_times {
            if let Some(dt) = resolve_local(tz, date, *at) {
                let utc = dt.with_timezone(&Utc);
                if utc > reference {
                    return Some(utc);
                }
            }
        }
    }
    None
}

fn next_weekly(
    interval: u32,
    weekdays: &[Weekday],
    at_times: &[AtTime],
    reference: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let start = reference.with_timezone(&tz).date_naive();
    let monday = start - chrono::Duration::days(start.weekday().num_days_from_monday() as i64);
    for step in 0..MAX_PERIOD_SCAN {
        // Step 0 covers the remainder of the reference week; later steps are
        // whole weeks, `interval` weeks apart.
        let week_start = if step == 0 {
            start
        } else {
            monday + chrono::Duration::days(7 * interval as i64 * step as i64)
        };
        let week_end = if step == 0 {
            monday + chrono::Duration::days(6)
        } else {
            week_start + chrono::Duration::days(6)
        };
        let mut date = week_start;
        while date <= week_end {
            if weekdays.contains(&date.weekday()) {
                for at in at_times {
                    if let Some(dt) = resolve_local(tz, date, *at) {
                        let utc = dt.with_timezone(&Utc);
                        if utc > reference {
                            return Some(utc);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
    }
    None
}

fn next_monthly(
    interval: u32,
    days: &[i8],
    at_times: &[AtTime],
    reference: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let start = reference.with_timezone(&tz).date_naive();
    for step in 0..MAX_PERIOD_SCAN {
        let (year, month) = add_months(start.year(), start.month(), interval * step);
        let len = days_in_month(year, month)?;
        let mut resolved: Vec<u32> = days.iter().filter_map(|d| resolve_day(*d, len)).collect();
        resolved.sort_unstable();
        resolved.dedup();
        for day in resolved {
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            for at in at_times {
                if let Some(dt) = resolve_local(tz, date, *at) {
                    let utc = dt.with_timezone(&Utc);
                    if utc > reference {
                        return Some(utc);
                    }
                }
            }
        }
    }
    None
}

/// Map a signed day-of-month onto a month of `len` days. Negative values
/// count back from the last day (-1 = last); the result is clamped to day 1
/// so it never underflows into the previous month. Positive days beyond the
/// month's length yield no candidate for that month.
fn resolve_day(day: i8, len: u32) -> Option<u32> {
    if day > 0 {
        let day = day as u32;
        (day <= len).then_some(day)
    } else {
        Some((len as i32 + day as i32 + 1).max(1) as u32)
    }
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = first.checked_add_months(chrono::Months::new(1))?;
    Some((next - first).num_days() as u32)
}

fn add_months(year: i32, month: u32, add: u32) -> (i32, u32) {
    let total = year as i64 * 12 + (month as i64 - 1) + add as i64;
    (total.div_euclid(12) as i32, (total.rem_euclid(12) + 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn compile(spec: Schedule) -> Compiled {
        Compiled::compile(&spec).unwrap()
    }

    // ── interval ─────────────────────────────────────────────────────────────

    #[test]
    fn interval_adds_exact_duration() {
        let c = compile(Schedule::every(Duration::from_secs(30)));
        let reference = utc(2026, 3, 1, 12, 0, 0);
        assert_eq!(
            c.next_after(reference, UTC).unwrap(),
            reference + chrono::Duration::seconds(30)
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Compiled::compile(&Schedule::every(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
    }

    // ── random interval ──────────────────────────────────────────────────────

    #[test]
    fn random_interval_stays_within_bounds() {
        let min = Duration::from_secs(10);
        let max = Duration::from_secs(20);
        let c = compile(Schedule::every_random(min, max));
        let reference = utc(2026, 3, 1, 0, 0, 0);
        for _ in 0..100 {
            let next = c.next_after(reference, UTC).unwrap();
            let gap = (next - reference).to_std().unwrap();
            assert!(gap >= min, "gap {gap:?} below min");
            assert!(gap < max, "gap {gap:?} not below max");
        }
    }

    #[test]
    fn random_interval_requires_min_below_max() {
        let err = Compiled::compile(&Schedule::every_random(
            Duration::from_secs(5),
            Duration::from_secs(5),
        ))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
        assert!(Compiled::compile(&Schedule::every_random(
            Duration::ZERO,
            Duration::from_secs(5),
        ))
        .is_err());
    }

    // ── cron ─────────────────────────────────────────────────────────────────

    #[test]
    fn five_field_cron_fires_at_second_zero() {
        let c = compile(Schedule::cron("*/5 * * * *", false));
        let next = c.next_after(utc(2026, 3, 1, 12, 1, 30), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 5, 0));
    }

    #[test]
    fn six_field_cron_has_second_resolution() {
        let c = compile(Schedule::cron("30 * * * * *", true));
        let next = c.next_after(utc(2026, 3, 1, 12, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 0, 30));
    }

    #[test]
    fn cron_field_count_mismatch_is_rejected() {
        assert!(Compiled::compile(&Schedule::cron("* * * * * *", false)).is_err());
        assert!(Compiled::compile(&Schedule::cron("* * * * *", true)).is_err());
    }

    #[test]
    fn unparsable_cron_is_rejected() {
        let err = Compiled::compile(&Schedule::cron("not a cron", false)).unwrap_err();
        assert!(matches!(err, Error::InvalidCronExpression { .. }));
    }

    #[test]
    fn cron_evaluates_in_job_timezone() {
        // 08:00 New York is 13:00 UTC in winter (EST, UTC-5).
        let c = compile(Schedule::cron("0 8 * * *", false));
        let next = c.next_after(utc(2026, 1, 10, 0, 0, 0), New_York).unwrap();
        assert_eq!(next, utc(2026, 1, 10, 13, 0, 0));
    }

    // ── daily ────────────────────────────────────────────────────────────────

    #[test]
    fn daily_picks_earliest_remaining_time_today() {
        let c = compile(Schedule::daily(
            1,
            vec![AtTime::new(9, 0, 0), AtTime::new(17, 30, 0)],
        ));
        let next = c.next_after(utc(2026, 3, 2, 10, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 2, 17, 30, 0));
    }

    #[test]
    fn daily_advances_by_interval_days_when_today_is_spent() {
        let c = compile(Schedule::daily(3, vec![AtTime::new(9, 0, 0)]));
        let next = c.next_after(utc(2026, 3, 2, 10, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 5, 9, 0, 0));
    }

    #[test]
    fn daily_at_exact_reference_moves_to_next_period() {
        // Strictly after: a reference equal to the fire time must not re-fire.
        let c = compile(Schedule::daily(1, vec![AtTime::new(9, 0, 0)]));
        let next = c.next_after(utc(2026, 3, 2, 9, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 3, 9, 0, 0));
    }

    #[test]
    fn dst_gap_time_is_shifted_forward() {
        // US spring-forward 2026-03-08: 02:30 EST does not exist in New York.
        let c = compile(Schedule::daily(1, vec![AtTime::new(2, 30, 0)]));
        let next = c.next_after(utc(2026, 3, 8, 1, 0, 0), New_York).unwrap();
        let local = next.with_timezone(&New_York);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2026, 3, 8).unwrap());
        assert_eq!((local.hour(), local.minute()), (3, 30));
    }

    #[test]
    fn empty_at_times_is_rejected() {
        assert!(Compiled::compile(&Schedule::daily(1, vec![])).is_err());
    }

    #[test]
    fn out_of_range_at_time_is_rejected() {
        assert!(Compiled::compile(&Schedule::daily(1, vec![AtTime::new(24, 0, 0)])).is_err());
        assert!(Compiled::compile(&Schedule::daily(1, vec![AtTime::new(10, 60, 0)])).is_err());
    }

    // ── weekly ───────────────────────────────────────────────────────────────

    #[test]
    fn weekly_finds_next_matching_weekday() {
        // 2026-03-02 is a Monday.
        let c = compile(Schedule::weekly(
            1,
            vec![Weekday::Wed, Weekday::Fri],
            vec![AtTime::new(8, 0, 0)],
        ));
        let next = c.next_after(utc(2026, 3, 2, 12, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 4, 8, 0, 0));
    }

    #[test]
    fn weekly_interval_skips_whole_weeks() {
        // Reference Friday after the fire time; interval 2 jumps to the week
        // two weeks after the current one.
        let c = compile(Schedule::weekly(2, vec![Weekday::Fri], vec![AtTime::new(8, 0, 0)]));
        let next = c.next_after(utc(2026, 3, 6, 9, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 20, 8, 0, 0));
    }

    #[test]
    fn weekly_requires_a_weekday() {
        assert!(Compiled::compile(&Schedule::weekly(1, vec![], vec![AtTime::new(8, 0, 0)])).is_err());
    }

    // ── monthly ──────────────────────────────────────────────────────────────

    #[test]
    fn monthly_minus_one_is_last_day_of_month() {
        let c = compile(Schedule::monthly(1, vec![-1], vec![AtTime::new(10, 30, 0)]));
        let next = c.next_after(utc(2026, 1, 15, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 1, 31, 10, 30, 0));
    }

    #[test]
    fn monthly_minus_one_handles_leap_february() {
        let c = compile(Schedule::monthly(1, vec![-1], vec![AtTime::new(0, 0, 0)]));
        // 2028 is a leap year, 2026 is not.
        let leap = c.next_after(utc(2028, 2, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(leap, utc(2028, 2, 29, 0, 0, 0));
        let common = c.next_after(utc(2026, 2, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(common, utc(2026, 2, 28, 0, 0, 0));
    }

    #[test]
    fn monthly_minus_five_on_february_is_day_24() {
        let c = compile(Schedule::monthly(1, vec![-5], vec![AtTime::new(12, 0, 0)]));
        let next = c.next_after(utc(2026, 2, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 2, 24, 12, 0, 0));
    }

    #[test]
    fn monthly_deep_negative_clamps_to_first_day() {
        let c = compile(Schedule::monthly(1, vec![-31], vec![AtTime::new(12, 0, 0)]));
        let next = c.next_after(utc(2026, 2, 1, 0, 0, 0), UTC).unwrap();
        // February 2026 has 28 days; -31 clamps to day 1, already past the
        // reference day start, so it fires at 12:00 on the 1st.
        assert_eq!(next, utc(2026, 2, 1, 12, 0, 0));
    }

    #[test]
    fn monthly_positive_day_skips_shorter_months() {
        let c = compile(Schedule::monthly(1, vec![31], vec![AtTime::new(9, 0, 0)]));
        // April has 30 days; the next 31st after April 1 is May 31.
        let next = c.next_after(utc(2026, 4, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 5, 31, 9, 0, 0));
    }

    #[test]
    fn monthly_interval_steps_months() {
        let c = compile(Schedule::monthly(3, vec![1], vec![AtTime::new(0, 0, 0)]));
        let next = c.next_after(utc(2026, 1, 2, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, utc(2026, 4, 1, 0, 0, 0));
    }

    #[test]
    fn monthly_day_zero_is_rejected() {
        let err =
            Compiled::compile(&Schedule::monthly(1, vec![0], vec![AtTime::new(0, 0, 0)]))
                .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
    }

    #[test]
    fn monthly_duplicate_days_are_collapsed() {
        let c = compile(Schedule::monthly(1, vec![5, 5, -1], vec![AtTime::new(0, 0, 0)]));
        match c {
            Compiled::Monthly { days, .. } => assert_eq!(days, vec![-1, 5]),
            other => panic!("unexpected compiled variant: {other:?}"),
        }
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn days_in_month_knows_february() {
        assert_eq!(days_in_month(2026, 2), Some(28));
        assert_eq!(days_in_month(2028, 2), Some(29));
        assert_eq!(days_in_month(2026, 12), Some(31));
    }

    #[test]
    fn add_months_wraps_years() {
        assert_eq!(add_months(2026, 11, 3), (2027, 2));
        assert_eq!(add_months(2026, 1, 24), (2028, 1));
    }
}
