//! Cron scheduling for the tick loop.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// When the mailroom ticks.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    /// Cron expression (with seconds field).
    pub cron: String,

    schedule: Schedule,

    /// Last run time.
    pub last_run: Option<DateTime<Utc>>,

    /// Next run time.
    pub next_run: Option<DateTime<Utc>>,
}

impl TickSchedule {
    pub fn new(cron: &str) -> Result<Self> {
        let schedule = Schedule::from_str(cron)
            .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {}", cron, e)))?;
        Ok(Self {
            cron: cron.to_string(),
            schedule,
            last_run: None,
            next_run: None,
        })
    }

    /// Tick every `seconds` seconds (1..=59).
    pub fn interval(seconds: u32) -> Result<Self> {
        if !(1..=59).contains(&seconds) {
            return Err(Error::Config(format!(
                "Interval must be between 1 and 59 seconds, got {}",
                seconds
            )));
        }
        Self::new(&format!("*/{} * * * * *", seconds))
    }

    /// Calculate the first fire time strictly after `after`.
    pub fn calculate_next_run(&mut self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = self
            .schedule
            .after(&after)
            .next()
            .ok_or_else(|| Error::Config(format!("No upcoming run for '{}'", self.cron)))?;
        self.next_run = Some(next);
        Ok(next)
    }

    /// Whether a tick should run now. Never-scheduled counts as due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.map_or(true, |next| next <= now)
    }

    /// Mark as run and schedule the following fire time.
    pub fn mark_run(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.last_run = Some(now);
        self.calculate_next_run(now)
    }
}
