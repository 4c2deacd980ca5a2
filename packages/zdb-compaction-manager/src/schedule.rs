//! Cron-driven compaction trigger
//!
//! Accepted forms:
//!
//! - seconds-first cron: `sec min hour day-of-month month [day-of-week [year]]`,
//!   e.g. `0 0 3 * * *` for every day at 03:00 UTC. A missing day-of-week
//!   means every day.
//! - descriptors: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`
//! - fixed interval: `@every <duration>`, e.g. `@every 6h` or `@every 1h30m`.
//!   Whole seconds only, at least one second. Fractional units such as
//!   `1.5h` are not accepted.

use std::str::FromStr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use cron::Schedule;

use crate::error::{ManagerError, Result};
use crate::supervisor::CompactionTrigger;

const EVERY_PREFIX: &str = "@every";

#[derive(Debug, Clone)]
enum Firing {
    Cron(Schedule),
    Every(TimeDelta),
}

/// A parsed compaction schedule
#[derive(Debug, Clone)]
pub struct CompactionSchedule {
    expr: String,
    firing: Firing,
}

impl CompactionSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let invalid = |reason: String| ManagerError::Schedule {
            expr: expr.to_string(),
            reason,
        };

        if expr.is_empty() {
            return Err(invalid("empty schedule".to_string()));
        }

        let firing = if let Some(interval) = expr.strip_prefix(EVERY_PREFIX) {
            Firing::Every(parse_interval(interval).map_err(invalid)?)
        } else {
            let normalized = normalize_cron(expr);
            let schedule =
                Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
            Firing::Cron(schedule)
        };

        Ok(Self {
            expr: expr.to_string(),
            firing,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First firing strictly after `after`, if the schedule has one
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.firing {
            Firing::Cron(schedule) => schedule.after(after).next(),
            Firing::Every(interval) => after.trunc_subsecs(0).checked_add_signed(*interval),
        }
    }
}

/// Parse the `<duration>` of `@every <duration>`, truncated to whole seconds
fn parse_interval(raw: &str) -> std::result::Result<TimeDelta, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("missing interval after @every".to_string());
    }

    let interval = humantime::parse_duration(raw).map_err(|e| e.to_string())?;
    let interval = Duration::from_secs(interval.as_secs());
    if interval.is_zero() {
        return Err("interval must be at least one second".to_string());
    }
    TimeDelta::from_std(interval).map_err(|_| "interval out of range".to_string())
}

/// Expand descriptors and fill in a missing day-of-week
fn normalize_cron(expr: &str) -> String {
    let expanded = match expr {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        _ => expr,
    };

    if expanded.split_whitespace().count() == 5 {
        format!("{expanded} *")
    } else {
        expanded.to_string()
    }
}

/// Running scheduler thread. Dropping the handle stops it.
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("scheduler thread panicked");
            }
        }
    }
}

/// Fire `trigger` at every instant of `schedule` until the handle is dropped
pub fn start(schedule: CompactionSchedule, trigger: CompactionTrigger) -> Result<SchedulerHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let thread = thread::Builder::new()
        .name("compaction-scheduler".to_string())
        .spawn(move || loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(&now) else {
                tracing::info!(schedule = schedule.expr(), "schedule has no further instants");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(%next, "next compaction");

            match stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    tracing::info!(%next, "scheduled compaction");
                    trigger.fire();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .map_err(|source| ManagerError::Process {
            op: "spawn scheduler thread",
            source,
        })?;

    Ok(SchedulerHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}
