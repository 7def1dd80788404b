use {
    anyhow::{Result, anyhow, bail},
    cadence_scheduler::{IntervalUnit, Schedule},
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    clap::Args,
};

#[derive(Args)]
pub struct NextArgs {
    /// Cron expression (5, 6 or 7 fields).
    #[arg(long, conflicts_with = "interval")]
    cron: Option<String>,
    /// IANA timezone for the cron expression.
    #[arg(long, default_value = "UTC")]
    tz: String,
    /// Interval length.
    #[arg(long, requires = "unit")]
    interval: Option<i64>,
    /// Interval unit (minutes, hours, days).
    #[arg(long)]
    unit: Option<String>,
    /// Number of upcoming times to print.
    #[arg(long, default_value_t = 5)]
    count: usize,
    /// Compute from this RFC 3339 instant instead of now. Interval schedules
    /// are anchored here.
    #[arg(long)]
    after: Option<DateTime<Utc>>,
}

pub fn handle_next(args: NextArgs) -> Result<()> {
    let schedule = schedule_from_args(&args)?;
    let after = args.after.unwrap_or_else(Utc::now);
    let times = upcoming(&schedule, after, args.count);
    if times.is_empty() {
        println!("no upcoming execution time");
    }
    for t in times {
        match &schedule {
            Schedule::Cron { timezone, .. } => {
                println!("{}  ({})", t.to_rfc3339(), t.with_timezone(timezone));
            },
            Schedule::Period { .. } => println!("{}", t.to_rfc3339()),
        }
    }
    Ok(())
}

fn schedule_from_args(args: &NextArgs) -> Result<Schedule> {
    match (&args.cron, args.interval, &args.unit) {
        (Some(expression), None, _) => {
            let timezone: Tz = args
                .tz
                .parse()
                .map_err(|e| anyhow!("invalid timezone '{}': {e}", args.tz))?;
            Ok(Schedule::cron(expression.clone(), timezone)?)
        },
        (None, Some(interval), Some(unit)) => {
            let unit: IntervalUnit = unit.parse()?;
            Ok(Schedule::interval(interval, unit)?)
        },
        _ => bail!("pass either --cron, or --interval with --unit"),
    }
}

/// The next `count` execution times after `after`. Interval schedules are
/// anchored at `after`.
fn upcoming(schedule: &Schedule, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let mut times = Vec::with_capacity(count);
    let mut cursor = after;
    while times.len() < count {
        let Some(next) = schedule.next_execution_time(after, cursor) else {
            break;
        };
        times.push(next);
        cursor = next;
    }
    times
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn interval_times_step_by_period() {
        let schedule = Schedule::interval(2, IntervalUnit::Hours).unwrap();
        let times = upcoming(&schedule, t0(), 3);
        assert_eq!(times, vec![
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
        ]);
    }

    #[test]
    fn cron_times_follow_timezone() {
        let schedule = Schedule::cron("30 9 * * *", chrono_tz::Europe::Berlin).unwrap();
        let times = upcoming(&schedule, t0(), 2);
        assert_eq!(times, vec![
            Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 8, 30, 0).unwrap(),
        ]);
    }

    #[test]
    fn impossible_cron_yields_nothing() {
        let schedule = Schedule::cron("0/5 * 30 2 *", Tz::UTC).unwrap();
        assert!(upcoming(&schedule, t0(), 3).is_empty());
    }
}
