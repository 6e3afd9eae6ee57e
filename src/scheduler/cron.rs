//! 5-field cron expressions.
//!
//! User-facing job schedules are classic crontab syntax — minute, hour,
//! day-of-month, month, day-of-week — with `*`, ranges, lists, and step
//! values. Validation happens at parse time; occurrence computation is
//! delegated to the `cron` crate by pinning the seconds field to zero.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;

/// A validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSpec {
    /// Parse and validate. Rejects anything that is not exactly five
    /// fields of valid cron syntax.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                    fields.len()
                ),
            });
        }

        let normalized = fields.join(" ");
        let with_seconds = format!("0 {normalized}");
        let schedule =
            cron::Schedule::from_str(&with_seconds).map_err(|e| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            expr: normalized,
            schedule,
        })
    }

    /// The normalized expression text.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Earliest matching instant strictly after `after`. `None` for
    /// expressions that can never fire (e.g. Feb 30) — the schedule
    /// search is bounded, not an infinite loop.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Next fire time from now.
    pub fn next_from_now(&self) -> Option<DateTime<Utc>> {
        self.next_after(Utc::now())
    }
}

impl FromStr for CronSpec {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expr)
    }
}
