//! Next-run computation for cron and interval schedules.

use {
    chrono::{DateTime, Months, TimeDelta, Utc},
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result};

/// How far ahead a cron expression is searched before giving up.
const CRON_LOOKAHEAD: Months = Months::new(12 * 10);

/// Unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    #[serde(alias = "minutes")]
    Minutes,
    #[serde(alias = "hours")]
    Hours,
    #[serde(alias = "days")]
    Days,
}

impl IntervalUnit {
    fn millis(self) -> i64 {
        match self {
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
            Self::Days => 86_400_000,
        }
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minutes),
            "h" | "hour" | "hours" => Ok(Self::Hours),
            "d" | "day" | "days" => Ok(Self::Days),
            other => Err(Error::validation(format!(
                "unsupported interval unit '{other}' (expected minutes, hours or days)"
            ))),
        }
    }
}

/// When a job fires.
///
/// Serialized as `{"cron": {"expression": "...", "timezone": "..."}}` or
/// `{"period": {"interval": 5, "unit": "MINUTES"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Cron { expression: String, timezone: Tz },
    Period { interval: i64, unit: IntervalUnit },
}

impl Schedule {
    /// Build a validated cron schedule.
    pub fn cron(expression: impl Into<String>, timezone: Tz) -> Result<Self> {
        let schedule = Self::Cron {
            expression: expression.into(),
            timezone,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Build a validated interval schedule.
    pub fn interval(interval: i64, unit: IntervalUnit) -> Result<Self> {
        let schedule = Self::Period { interval, unit };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron { expression, .. } => parse_cron(expression).map(|_| ()),
            Self::Period { .. } => self.period().map(|_| ()),
        }
    }

    /// Length of one interval period. Errors for cron schedules and
    /// non-positive intervals.
    pub fn period(&self) -> Result<TimeDelta> {
        let Self::Period { interval, unit } = self else {
            return Err(Error::validation("cron schedules have no fixed period"));
        };
        if *interval <= 0 {
            return Err(Error::validation(format!(
                "interval must be > 0, got {interval}"
            )));
        }
        interval
            .checked_mul(unit.millis())
            .and_then(TimeDelta::try_milliseconds)
            .ok_or_else(|| Error::validation(format!("interval {interval} is too large")))
    }

    /// First execution strictly after `after`.
    ///
    /// Interval schedules advance `anchor` by whole periods, skipping any
    /// fires missed before `after`; an anchor in the future is itself the next
    /// fire. Cron schedules ignore `anchor` and return `None` when nothing
    /// matches within ten years.
    pub fn next_execution_time(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Period { .. } => {
                let period = self.period().ok()?;
                if anchor > after {
                    return Some(anchor);
                }
                let period_ms = period.num_milliseconds();
                let elapsed = (after - anchor).num_milliseconds();
                let periods = elapsed / period_ms + 1;
                let offset = TimeDelta::try_milliseconds(periods.checked_mul(period_ms)?)?;
                anchor.checked_add_signed(offset)
            },
            Self::Cron {
                expression,
                timezone,
            } => {
                let schedule = parse_cron(expression).ok()?;
                let limit = after.checked_add_months(CRON_LOOKAHEAD)?;
                schedule
                    .after(&after.with_timezone(timezone))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
                    .filter(|next| *next <= limit)
            },
        }
    }

    /// Whether the next execution after `anchor` lands inside `[start, end)`.
    pub fn is_starting_within_window(
        &self,
        anchor: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> bool {
        let Some(just_before) = start.checked_sub_signed(TimeDelta::milliseconds(1)) else {
            return false;
        };
        self.next_execution_time(anchor, just_before)
            .is_some_and(|next| next >= start && next < end)
    }

    /// The period `[start, end)` covered by a run that finishes its window at
    /// `end`. For cron schedules `start` is the previous matching time, or
    /// `end` itself when there is none.
    pub fn period_ending_at(&self, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = match self {
            Self::Period { .. } => self
                .period()
                .ok()
                .and_then(|period| end.checked_sub_signed(period)),
            Self::Cron {
                expression,
                timezone,
            } => parse_cron(expression).ok().and_then(|schedule| {
                schedule
                    .after(&end.with_timezone(timezone))
                    .next_back()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        };
        (start.unwrap_or(end), end)
    }

    /// The period `[start, end)` that begins at `start`.
    pub fn period_starting_at(&self, start: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = match self {
            Self::Period { .. } => self
                .period()
                .ok()
                .and_then(|period| start.checked_add_signed(period)),
            Self::Cron { .. } => self.next_execution_time(start, start),
        };
        (start, end.unwrap_or(start))
    }

    /// Whether the last execution happened when it was supposed to.
    ///
    /// A job that never ran is on time. An interval job is on time while its
    /// last run is less than one period old; a cron job is on time when its
    /// last run matches the most recent expected fire to the second.
    pub fn running_on_time(
        &self,
        last_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = last_execution else {
            return true;
        };
        match self {
            Self::Period { .. } => {
                let Ok(period) = self.period() else {
                    return false;
                };
                let delta = now - last;
                delta > TimeDelta::zero() && delta < period
            },
            Self::Cron {
                expression,
                timezone,
            } => {
                let Ok(schedule) = parse_cron(expression) else {
                    return false;
                };
                let Some(expected) = schedule
                    .after(&now.with_timezone(timezone))
                    .next_back()
                    .map(|dt| dt.with_timezone(&Utc))
                else {
                    return false;
                };
                (last - expected).num_seconds() == 0
            },
        }
    }
}

/// Parse a cron expression.
///
/// Five-field UNIX expressions (`min hour dom month dow`) are padded with a
/// zero seconds field and a wildcard year, and their numeric day-of-week
/// values (0 or 7 = Sunday) are translated to names. Six and seven field
/// expressions are handed to the `cron` crate unchanged.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {minute} {hour} {dom} {month} {} *", unix_dow(dow))
        },
        _ => fields.join(" "),
    };
    normalized
        .parse::<cron::Schedule>()
        .map_err(|source| Error::CronParse {
            expression: expression.to_string(),
            source,
        })
}

fn dow_name(token: &str) -> Option<&'static str> {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];
    token
        .parse::<usize>()
        .ok()
        .and_then(|n| NAMES.get(n).copied())
}

fn unix_dow(field: &str) -> String {
    field
        .split(',')
        .map(unix_dow_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn unix_dow_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, format!("/{step}")),
        None => (item, String::new()),
    };
    match range.split_once('-') {
        Some((from, to)) => match (dow_name(from), dow_name(to)) {
            // 0-7 covers the whole week.
            (Some("SUN"), Some(_)) if to == "7" => format!("SUN-SAT{step}"),
            (Some("SAT"), Some(_)) if to == "7" => "SAT,SUN".to_string(),
            // N-7 wraps onto Sunday.
            (Some(from), Some(_)) if to == "7" => format!("{from}-SAT{step},SUN"),
            (Some(from), Some(to)) => format!("{from}-{to}{step}"),
            _ => item.to_string(),
        },
        None => match dow_name(range) {
            Some(name) => format!("{name}{step}"),
            None => item.to_string(),
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone, rstest::rstest};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn interval_half_period_lands_on_next_boundary() {
        let schedule = Schedule::interval(10, IntervalUnit::Minutes).unwrap();
        let t = utc(2024, 1, 1, 12, 0);
        let next = schedule.next_execution_time(t, t + TimeDelta::minutes(5));
        assert_eq!(next, Some(t + TimeDelta::minutes(10)));
    }

    #[test]
    fn interval_skips_missed_fires() {
        let schedule = Schedule::interval(1, IntervalUnit::Hours).unwrap();
        let anchor = utc(2024, 1, 1, 0, 0);
        let next = schedule.next_execution_time(anchor, utc(2024, 1, 1, 5, 30));
        assert_eq!(next, Some(utc(2024, 1, 1, 6, 0)));
    }

    #[test]
    fn interval_at_boundary_is_strictly_after() {
        let schedule = Schedule::interval(1, IntervalUnit::Days).unwrap();
        let anchor = utc(2024, 1, 1, 0, 0);
        assert_eq!(
            schedule.next_execution_time(anchor, anchor),
            Some(utc(2024, 1, 2, 0, 0))
        );
    }

    #[test]
    fn interval_future_anchor_is_next_fire() {
        let schedule = Schedule::interval(5, IntervalUnit::Minutes).unwrap();
        let anchor = utc(2024, 6, 1, 0, 0);
        assert_eq!(
            schedule.next_execution_time(anchor, utc(2024, 5, 1, 0, 0)),
            Some(anchor)
        );
    }

    #[rstest]
    #[case(0)]
    #[case(-3)]
    fn non_positive_interval_rejected(#[case] interval: i64) {
        assert!(Schedule::interval(interval, IntervalUnit::Minutes).is_err());
    }

    #[test]
    fn cron_in_paris() {
        let schedule = Schedule::cron("0 9 * * *", chrono_tz::Europe::Paris).unwrap();
        let next = schedule
            .next_execution_time(utc(2024, 2, 1, 0, 0), utc(2024, 2, 1, 0, 0))
            .unwrap();
        assert_eq!(next, utc(2024, 2, 1, 8, 0));
    }

    #[test]
    fn cron_across_dst_start() {
        let schedule = Schedule::cron("0 9 * * *", chrono_tz::America::New_York).unwrap();
        let after = utc(2024, 3, 10, 0, 0);
        let next = schedule.next_execution_time(after, after).unwrap();
        assert_eq!(next, utc(2024, 3, 10, 13, 0));

        let before_dst = schedule
            .next_execution_time(after, utc(2024, 3, 9, 0, 0))
            .unwrap();
        assert_eq!(before_dst, utc(2024, 3, 9, 14, 0));
    }

    #[test]
    fn impossible_cron_has_no_next_time() {
        let schedule = Schedule::cron("0/5 * 30 2 *", Tz::UTC).unwrap();
        let now = utc(2024, 1, 1, 0, 0);
        assert_eq!(schedule.next_execution_time(now, now), None);
    }

    #[rstest]
    #[case("0 9 * * 1", utc(2024, 2, 5, 9, 0))]
    #[case("0 9 * * 0", utc(2024, 2, 4, 9, 0))]
    #[case("0 9 * * 7", utc(2024, 2, 4, 9, 0))]
    #[case("0 9 * * 1-5", utc(2024, 2, 1, 9, 0))]
    #[case("0 9 * * 6-7", utc(2024, 2, 3, 9, 0))]
    #[case("0 9 * * 5-7", utc(2024, 2, 2, 9, 0))]
    fn unix_day_of_week_numbering(#[case] expression: &str, #[case] expected: DateTime<Utc>) {
        // 2024-02-01 is a Thursday.
        let schedule = Schedule::cron(expression, Tz::UTC).unwrap();
        let after = utc(2024, 2, 1, 0, 0);
        assert_eq!(schedule.next_execution_time(after, after), Some(expected));
    }

    #[test]
    fn six_field_expression_accepted() {
        let schedule = Schedule::cron("30 0 9 * * *", Tz::UTC).unwrap();
        let after = utc(2024, 2, 1, 0, 0);
        let next = schedule.next_execution_time(after, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 30).unwrap());
    }

    #[test]
    fn malformed_cron_rejected() {
        assert!(Schedule::cron("not a cron", Tz::UTC).is_err());
        assert!(Schedule::cron("61 * * * *", Tz::UTC).is_err());
    }

    #[test]
    fn window_check_is_half_open() {
        let schedule = Schedule::interval(1, IntervalUnit::Hours).unwrap();
        let anchor = utc(2024, 1, 1, 0, 0);
        assert!(schedule.is_starting_within_window(
            anchor,
            utc(2024, 1, 1, 1, 0),
            utc(2024, 1, 1, 1, 30)
        ));
        assert!(!schedule.is_starting_within_window(
            anchor,
            utc(2024, 1, 1, 1, 10),
            utc(2024, 1, 1, 2, 0)
        ));
    }

    #[test]
    fn periods_for_interval_and_cron() {
        let interval = Schedule::interval(15, IntervalUnit::Minutes).unwrap();
        let end = utc(2024, 1, 1, 10, 0);
        assert_eq!(interval.period_ending_at(end), (utc(2024, 1, 1, 9, 45), end));
        assert_eq!(
            interval.period_starting_at(end),
            (end, utc(2024, 1, 1, 10, 15))
        );

        let cron = Schedule::cron("0 * * * *", Tz::UTC).unwrap();
        assert_eq!(cron.period_ending_at(end), (utc(2024, 1, 1, 9, 0), end));
        assert_eq!(cron.period_starting_at(end), (end, utc(2024, 1, 1, 11, 0)));
    }

    #[test]
    fn running_on_time_checks() {
        let interval = Schedule::interval(10, IntervalUnit::Minutes).unwrap();
        let now = utc(2024, 1, 1, 12, 0);
        assert!(interval.running_on_time(None, now));
        assert!(interval.running_on_time(Some(now - TimeDelta::minutes(3)), now));
        assert!(!interval.running_on_time(Some(now - TimeDelta::minutes(30)), now));

        let cron = Schedule::cron("0 * * * *", Tz::UTC).unwrap();
        let now = utc(2024, 1, 1, 12, 20);
        assert!(cron.running_on_time(Some(utc(2024, 1, 1, 12, 0)), now));
        assert!(!cron.running_on_time(Some(utc(2024, 1, 1, 11, 0)), now));
    }

    #[test]
    fn json_shape() {
        let schedule: Schedule = serde_json::from_str(
            r#"{"cron": {"expression": "0 9 * * *", "timezone": "Europe/Paris"}}"#,
        )
        .unwrap();
        assert_eq!(
            schedule,
            Schedule::cron("0 9 * * *", chrono_tz::Europe::Paris).unwrap()
        );

        let period: Schedule =
            serde_json::from_str(r#"{"period": {"interval": 5, "unit": "minutes"}}"#).unwrap();
        assert_eq!(
            serde_json::to_value(&period).unwrap(),
            serde_json::json!({"period": {"interval": 5, "unit": "MINUTES"}})
        );

        assert!(
            serde_json::from_str::<Schedule>(r#"{"period": {"interval": 5, "unit": "WEEKS"}}"#)
                .is_err()
        );
    }
}
