use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use cron::Schedule;

use super::{CheckInput, CheckOutput, Evidence};
use crate::audit::{Operation, OperationError};
use crate::store::{sql_timestamp, Record, StoreConnection};

/// Due when the reference instant lies in the current firing window of `refresh_cron`.
pub struct ScheduleCheck;

impl Operation for ScheduleCheck {
    type Input = CheckInput;
    type Output = CheckOutput;

    fn action(&self) -> &'static str {
        "check_cron"
    }

    fn description(&self) -> &'static str {
        "Check readiness by cron schedule"
    }

    fn run(
        &self,
        _conn: &mut dyn StoreConnection,
        input: &CheckInput,
    ) -> Result<CheckOutput, OperationError> {
        let expression = input
            .refresh_cron
            .as_deref()
            .filter(|cron| !cron.trim().is_empty())
            .ok_or(OperationError::MissingInput("refresh_cron"))?;
        let schedule = parse_schedule(expression)?;

        let (prev, next) = window(&schedule, input.evaluated_at).ok_or_else(|| {
            OperationError::Invalid(format!("cron expression `{expression}` never fires"))
        })?;
        let reference = truncate_seconds(input.reference_time);
        let due = prev <= reference && reference < next;

        let evidence = Record::new()
            .with("refresh_date", sql_timestamp(prev))
            .with("next_date", sql_timestamp(next))
            .with("refresh_cron", expression)
            .with("current_date", sql_timestamp(reference))
            .with("refresh", due);
        Ok(CheckOutput {
            evidence: Evidence::Record(evidence),
            verdict: Some(due),
        })
    }
}

/// Accepts 5-field (minute-first) crontab lines by pinning seconds to zero.
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

pub fn parse_schedule(expression: &str) -> Result<Schedule, OperationError> {
    Schedule::from_str(&normalize_cron(expression)).map_err(|source| OperationError::Cron {
        expression: expression.to_string(),
        source,
    })
}

/// Firing window around `at`: latest firing at or before it, earliest firing strictly after.
///
/// Times are wall-clock and whole seconds; `None` when the schedule has no firing on one side.
pub fn window(schedule: &Schedule, at: NaiveDateTime) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let at = Utc.from_utc_datetime(&truncate_seconds(at));
    let prev = schedule.after(&(at + Duration::seconds(1))).next_back()?;
    let next = schedule.after(&at).next()?;
    Some((prev.naive_utc(), next.naive_utc()))
}

fn truncate_seconds(at: NaiveDateTime) -> NaiveDateTime {
    at.with_nanosecond(0).unwrap_or(at)
}
