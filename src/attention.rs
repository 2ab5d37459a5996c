//! Attention budget accounting.
//!
//! A queue has a fixed allowance of reading minutes. Every message sent
//! within the trailing window consumes part of it, and that consumption
//! decays exponentially with the hours elapsed since the send:
//!
//! ```text
//! weight    = exp(-hours_since_sent / halflife_hours)
//! consumed  = Σ duration_minutes * weight
//! remaining = max(0, budget_minutes - consumed)
//! ```
//!
//! Everything here is pure: callers pass `now` and the send history.

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};

use crate::config::{Attention, BudgetPolicy};
use crate::error::{Error, Result};

/// A past delivery, as far as the budget is concerned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendRecord {
    pub sent_at: DateTime<Utc>,
    pub estimated_duration_secs: f64,
}

impl SendRecord {
    pub fn new(sent_at: DateTime<Utc>, estimated_duration_secs: f64) -> Self {
        Self {
            sent_at,
            estimated_duration_secs,
        }
    }

    fn minutes(&self) -> f64 {
        self.estimated_duration_secs / 60.0
    }
}

/// Which hours a past send keeps costing attention in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetWindow {
    /// Every elapsed hour counts.
    Elapsed,
    /// Only hours between `hour_awake` and `hour_bedtime` (user local time)
    /// count, and nothing can be sent outside them.
    WakingHours {
        hour_awake: u32,
        hour_bedtime: u32,
        offset: FixedOffset,
    },
}

impl BudgetWindow {
    fn is_awake(&self, at: DateTime<Utc>) -> bool {
        match self {
            BudgetWindow::Elapsed => true,
            BudgetWindow::WakingHours {
                hour_awake,
                hour_bedtime,
                offset,
            } => {
                let hour = at.with_timezone(offset).hour();
                hour >= *hour_awake && hour < *hour_bedtime
            }
        }
    }

    /// Share of the elapsed time since `sent_at` that fell within waking hours.
    fn awake_fraction(&self, sent_at: DateTime<Utc>, now: DateTime<Utc>, hours_since: f64) -> f64 {
        if matches!(self, BudgetWindow::Elapsed) || hours_since <= 0.0 {
            return 1.0;
        }

        // Sampled hourly from the send instant, inclusive of both ends.
        let mut waking_hours = 0u32;
        let mut current = sent_at;
        while current <= now {
            if self.is_awake(current) {
                waking_hours += 1;
            }
            current += Duration::hours(1);
        }

        (waking_hours as f64 / hours_since).clamp(0.0, 1.0)
    }
}

/// Decay law applied to past sends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayPolicy {
    pub halflife_hours: f64,
    pub window: Duration,
    pub budget_window: BudgetWindow,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            halflife_hours: 6.0,
            window: Duration::hours(36),
            budget_window: BudgetWindow::Elapsed,
        }
    }
}

impl DecayPolicy {
    pub fn from_settings(attention: &Attention) -> Result<Self> {
        let budget_window = match attention.policy {
            BudgetPolicy::Elapsed => BudgetWindow::Elapsed,
            BudgetPolicy::WakingHours => {
                let offset = attention
                    .utc_offset_minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "attention.utc_offset_minutes out of range: {}",
                            attention.utc_offset_minutes
                        ))
                    })?;
                BudgetWindow::WakingHours {
                    hour_awake: attention.hour_awake,
                    hour_bedtime: attention.hour_bedtime,
                    offset,
                }
            }
        };

        Ok(Self {
            halflife_hours: attention.halflife_hours,
            window: Duration::hours(attention.window_hours as i64),
            budget_window,
        })
    }

    /// Earliest send time still inside the trailing window.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    fn weight(&self, send: &SendRecord, now: DateTime<Utc>) -> f64 {
        let hours_since = (now - send.sent_at).num_milliseconds() as f64 / 3_600_000.0;
        let decay = (-hours_since / self.halflife_hours).exp();
        decay * self.budget_window.awake_fraction(send.sent_at, now, hours_since)
    }
}

/// Snapshot of a queue's attention budget at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub full_minutes: f64,
    pub consumed_minutes: f64,
    pub remaining_minutes: f64,
}

impl Budget {
    /// Whether a message of the given length may be sent now.
    ///
    /// A message longer than the whole budget is admitted only while the
    /// budget is untouched, otherwise it would block its queue forever.
    pub fn admits(&self, duration_secs: f64) -> bool {
        let minutes = duration_secs / 60.0;
        if minutes <= self.remaining_minutes {
            return true;
        }
        self.remaining_minutes > 0.0 && self.remaining_minutes >= self.full_minutes
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2} of {:.0} minutes remaining ({:.2} consumed)",
            self.remaining_minutes, self.full_minutes, self.consumed_minutes
        )
    }
}

/// Compute the remaining attention budget at `now`.
///
/// Sends outside `[now - window, now]` are ignored.
pub fn remaining_budget(
    budget_minutes: f64,
    sends: &[SendRecord],
    now: DateTime<Utc>,
    policy: &DecayPolicy,
) -> Budget {
    let window_start = policy.window_start(now);
    let consumed_minutes: f64 = sends
        .iter()
        .filter(|s| s.sent_at >= window_start && s.sent_at <= now)
        .map(|s| s.minutes() * policy.weight(s, now))
        .sum();

    let remaining_minutes = if policy.budget_window.is_awake(now) {
        (budget_minutes - consumed_minutes).max(0.0)
    } else {
        0.0
    };

    Budget {
        full_minutes: budget_minutes,
        consumed_minutes,
        remaining_minutes,
    }
}

/// Estimated reading time of `content` in seconds, never below one second.
pub fn estimate_reading_secs(content: &str, words_per_minute: u32) -> f64 {
    let words = content.split_whitespace().count() as f64;
    let wpm = words_per_minute.max(1) as f64;
    (words / wpm * 60.0).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_no_sends_gives_full_budget() {
        let budget = remaining_budget(60.0, &[], at(12, 0), &DecayPolicy::default());

        assert_eq!(budget.remaining_minutes, 60.0);
        assert_eq!(budget.consumed_minutes, 0.0);
    }

    #[test]
    fn test_single_send_six_hours_ago() {
        let now = at(18, 0);
        let sends = [SendRecord::new(now - Duration::hours(6), 30.0 * 60.0)];
        let budget = remaining_budget(60.0, &sends, now, &DecayPolicy::default());

        let expected = 60.0 - 30.0 * (-1.0f64).exp();
        assert!((budget.remaining_minutes - expected).abs() < 1e-9);
        assert!((budget.remaining_minutes - 48.96).abs() < 0.01);
    }

    #[test]
    fn test_remaining_is_clamped_to_zero() {
        let now = at(12, 0);
        let sends = [
            SendRecord::new(now, 50.0 * 60.0),
            SendRecord::new(now, 50.0 * 60.0),
        ];
        let budget = remaining_budget(60.0, &sends, now, &DecayPolicy::default());

        assert_eq!(budget.remaining_minutes, 0.0);
        assert!(budget.consumed_minutes > 60.0);
    }

    #[test]
    fn test_budget_recovers_as_time_passes() {
        let sent_at = at(6, 0);
        let sends = [SendRecord::new(sent_at, 45.0 * 60.0)];
        let policy = DecayPolicy::default();

        let mut previous = remaining_budget(60.0, &sends, sent_at, &policy).remaining_minutes;
        for hours in 1..36 {
            let now = sent_at + Duration::hours(hours);
            let remaining = remaining_budget(60.0, &sends, now, &policy).remaining_minutes;
            assert!(remaining > previous, "budget did not grow at +{}h", hours);
            assert!(remaining < 60.0);
            previous = remaining;
        }
        assert!(60.0 - previous < 0.25);
    }

    #[test]
    fn test_sends_outside_window_are_ignored() {
        let now = at(12, 0);
        let sends = [
            SendRecord::new(now - Duration::hours(40), 60.0 * 60.0),
            SendRecord::new(now + Duration::minutes(5), 60.0 * 60.0),
        ];
        let budget = remaining_budget(60.0, &sends, now, &DecayPolicy::default());

        assert_eq!(budget.remaining_minutes, 60.0);
    }

    #[test]
    fn test_longer_halflife_decays_slower() {
        let now = at(18, 0);
        let sends = [SendRecord::new(now - Duration::hours(6), 30.0 * 60.0)];
        let short = remaining_budget(60.0, &sends, now, &DecayPolicy::default());
        let long = remaining_budget(
            60.0,
            &sends,
            now,
            &DecayPolicy {
                halflife_hours: 12.0,
                ..DecayPolicy::default()
            },
        );

        assert!(long.remaining_minutes < short.remaining_minutes);
    }

    fn waking_policy() -> DecayPolicy {
        DecayPolicy {
            budget_window: BudgetWindow::WakingHours {
                hour_awake: 9,
                hour_bedtime: 17,
                offset: FixedOffset::east_opt(0).unwrap(),
            },
            ..DecayPolicy::default()
        }
    }

    #[test]
    fn test_waking_hours_blocks_sending_at_night() {
        let budget = remaining_budget(60.0, &[], at(22, 0), &waking_policy());

        assert_eq!(budget.remaining_minutes, 0.0);
        assert!(!budget.admits(60.0));
    }

    #[test]
    fn test_waking_hours_discounts_sleeping_hours() {
        // Sent at 16:00 the day before, now 10:00: most elapsed hours were asleep.
        let now = at(10, 0);
        let sends = [SendRecord::new(now - Duration::hours(18), 60.0 * 60.0)];

        let elapsed = remaining_budget(60.0, &sends, now, &DecayPolicy::default());
        let waking = remaining_budget(60.0, &sends, now, &waking_policy());

        assert!(waking.consumed_minutes < elapsed.consumed_minutes);
        assert!(waking.consumed_minutes > 0.0);
    }

    #[test]
    fn test_overflowing_utc_offset_is_an_error() {
        let attention = Attention {
            policy: BudgetPolicy::WakingHours,
            utc_offset_minutes: i32::MAX,
            ..Attention::default()
        };
        assert!(matches!(
            DecayPolicy::from_settings(&attention),
            Err(Error::Config(_))
        ));

        let attention = Attention {
            policy: BudgetPolicy::WakingHours,
            utc_offset_minutes: -300,
            ..Attention::default()
        };
        assert!(DecayPolicy::from_settings(&attention).is_ok());
    }

    #[test]
    fn test_admits() {
        let fresh = Budget {
            full_minutes: 60.0,
            consumed_minutes: 0.0,
            remaining_minutes: 60.0,
        };
        assert!(fresh.admits(30.0 * 60.0));
        // Longer than the whole budget, but nothing has been spent.
        assert!(fresh.admits(90.0 * 60.0));

        let used = Budget {
            full_minutes: 60.0,
            consumed_minutes: 40.0,
            remaining_minutes: 20.0,
        };
        assert!(used.admits(20.0 * 60.0));
        assert!(!used.admits(21.0 * 60.0));
        assert!(!used.admits(90.0 * 60.0));
    }

    #[test]
    fn test_estimate_reading_secs() {
        let content = vec!["word"; 500].join(" ");
        assert_eq!(estimate_reading_secs(&content, 250), 120.0);
        assert_eq!(estimate_reading_secs("", 250), 1.0);
        assert_eq!(estimate_reading_secs("  hello   world ", 120), 1.0);
    }
}
