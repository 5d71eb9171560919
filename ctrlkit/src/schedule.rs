//! Cron and periodic resync triggers.
//!
//! Both kinds of trigger do the same thing when they fire: push
//! [`DEFAULT_QUEUE_KEY`] onto the controller's queue. Duplicate firings
//! collapse in the queue, so schedules may overlap freely.
//!
//! Accepted expressions:
//!
//! - standard five-field cron (`min hour dom month dow`, Sunday is `0` or `7`)
//! - six or seven fields with a leading seconds column, passed to the `cron`
//!   parser unchanged
//! - `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`,
//!   `@hourly`
//! - `@every <duration>` in humantime syntax, e.g. `@every 1h30m`
//!
//! Cron schedules are evaluated in local time.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, ScheduleError};
use crate::queue::WorkQueue;
use crate::source::DEFAULT_QUEUE_KEY;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed resync schedule.
#[derive(Clone)]
pub enum ResyncSchedule {
    /// A cron expression.
    Cron {
        /// Expression as supplied by the caller.
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    /// A fixed interval (`@every`).
    Every(Duration),
}

impl ResyncSchedule {
    /// Parse a single schedule expression.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();

        if let Some(interval) = trimmed.strip_prefix("@every") {
            return parse_every(expression, interval.trim());
        }

        let normalized = normalize_cron(trimmed).map_err(|message| ScheduleError::Cron {
            expression: expression.to_string(),
            message,
        })?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|err| ScheduleError::Cron {
                expression: expression.to_string(),
                message: err.to_string(),
            })?;

        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// The first firing strictly after `now`, if the schedule has one.
    pub fn next_after(&self, now: &DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(now).next(),
            Self::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                now.checked_add_signed(interval)
            }
        }
    }
}

impl fmt::Display for ResyncSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => f.write_str(expression),
            Self::Every(interval) => {
                write!(f, "@every {}", humantime::format_duration(*interval))
            }
        }
    }
}

impl fmt::Debug for ResyncSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => f.debug_tuple("Cron").field(expression).finish(),
            Self::Every(interval) => f.debug_tuple("Every").field(interval).finish(),
        }
    }
}

fn parse_every(expression: &str, interval: &str) -> Result<ResyncSchedule, ScheduleError> {
    let invalid = |message: String| ScheduleError::Interval {
        expression: expression.to_string(),
        message,
    };

    let interval = humantime::parse_duration(interval).map_err(|err| invalid(err.to_string()))?;
    if interval.is_zero() {
        return Err(invalid("interval must be positive".to_string()));
    }
    Ok(ResyncSchedule::Every(interval))
}

/// Rewrite an expression into the dialect of the `cron` crate: named
/// shortcuts become explicit fields and five-field expressions gain a seconds
/// column and Quartz-style weekdays.
fn normalize_cron(expression: &str) -> Result<String, String> {
    let shortcut = match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    };
    if let Some(shortcut) = shortcut {
        return Ok(shortcut.to_string());
    }
    if expression.starts_with('@') {
        return Err(format!("unrecognized descriptor {expression:?}"));
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day_of_month, month, day_of_week] => Ok(format!(
            "0 {minute} {hour} {day_of_month} {month} {}",
            translate_day_of_week(day_of_week)?
        )),
        _ => Ok(fields.join(" ")),
    }
}

/// Standard cron numbers weekdays 0-7 from Sunday; the `cron` crate numbers
/// them 1-7. Numeric items are expanded to day names so both agree.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
                return Ok(item.to_string());
            }

            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: usize = step
                        .parse()
                        .map_err(|_| format!("invalid day-of-week step in {item:?}"))?;
                    if step == 0 {
                        return Err(format!("zero day-of-week step in {item:?}"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let parse_day = |value: &str| -> Result<u8, String> {
                value
                    .parse::<u8>()
                    .ok()
                    .filter(|day| *day <= 7)
                    .ok_or_else(|| format!("invalid day of week {value:?}"))
            };

            let (start, end) = match range.split_once('-') {
                _ if range == "*" => (0, 6),
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None if step.is_some() => (parse_day(range)?, 6),
                None => {
                    let day = parse_day(range)?;
                    (day, day)
                }
            };
            if start > end {
                return Err(format!("day-of-week range {range:?} runs backwards"));
            }

            let days: BTreeSet<usize> = (start..=end)
                .step_by(step.unwrap_or(1))
                .map(|day| usize::from(day) % 7)
                .collect();
            Ok(days
                .into_iter()
                .map(|day| WEEKDAYS[day])
                .collect::<Vec<_>>()
                .join(","))
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(items.join(","))
}

/// Parse every expression, reporting all failures at once.
pub(crate) fn parse_schedules(
    controller: &str,
    expressions: &[String],
) -> Result<Vec<ResyncSchedule>, ControllerError> {
    let mut schedules = Vec::with_capacity(expressions.len());
    let mut errors = Vec::new();

    for expression in expressions {
        match ResyncSchedule::parse(expression) {
            Ok(schedule) => schedules.push(schedule),
            Err(err) => errors.push(err),
        }
    }

    if errors.is_empty() {
        Ok(schedules)
    } else {
        Err(ControllerError::InvalidSchedules {
            controller: controller.to_string(),
            errors,
        })
    }
}

/// The action run by every trigger: enqueue the sentinel key.
#[derive(Clone, Debug)]
pub(crate) struct ScheduledJob {
    name: Arc<str>,
    queue: Arc<WorkQueue>,
}

impl ScheduledJob {
    pub(crate) fn new(name: Arc<str>, queue: Arc<WorkQueue>) -> Self {
        Self { name, queue }
    }

    pub(crate) fn run(&self) {
        tracing::debug!(controller = %self.name, "triggering scheduled sync");
        self.queue.add(DEFAULT_QUEUE_KEY);
    }
}

/// Fire `job` on `schedule` until `token` is cancelled.
pub(crate) async fn run_cron(schedule: ResyncSchedule, job: ScheduledJob, token: CancellationToken) {
    loop {
        let now = Local::now();
        let Some(next) = schedule.next_after(&now) else {
            tracing::debug!(controller = %job.name, %schedule, "schedule has no further firings");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => job.run(),
        }
    }
}

/// Fire `job` immediately and then every `interval` until `token` is
/// cancelled.
pub(crate) async fn run_periodic(interval: Duration, job: ScheduledJob, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => job.run(),
        }
    }
}
