use super::MessageState;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Scheduling directives of a message.
///
/// `delay` fires once, `delay` milliseconds after publishing.  `cron`
/// fires on every tick of the expression (seconds-precision, as
/// understood by the `cron` crate).  `repeat` fires the message
/// `repeat` more times, `repeat_period` milliseconds apart, after
/// each regular firing (the first firing, or each cron tick).
///
/// `repeat` therefore counts extra firings, never the total.  On its
/// own, `repeat: 3` delivers the message four times: once right away,
/// then three repeats.  With a `delay`, the first of those moves to
/// the end of the delay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub repeat: u32,
    #[serde(default)]
    pub repeat_period: u64,
}

impl MessageSchedule {
    #[must_use]
    pub fn is_scheduled(&self) -> bool { self.cron.is_some() || self.delay > 0 || self.repeat > 0 }

    pub fn validate(&self) -> Result<()> {
        if let Some(expression) = &self.cron {
            parse_cron(expression)?;
        }
        if self.repeat > 0 && self.repeat_period == 0 {
            return Err(Error::InvalidSchedule {
                reason: "a repeat requires a positive repeat period".to_owned(),
            });
        }
        if self.repeat == 0 && self.repeat_period > 0 {
            return Err(Error::InvalidSchedule {
                reason: "a repeat period requires a repeat count".to_owned(),
            });
        }
        Ok(())
    }

    /// Computes the next time the message is due, updating the
    /// scheduling counters in `state`, or `None` once the schedule
    /// is exhausted (or there never was one).
    ///
    /// Precedence: a pending delay is consumed first; then an
    /// outstanding repeat relative to the last firing; then the next
    /// cron tick; then, for repeat-only schedules, an immediate first
    /// firing.
    pub fn next_timestamp(&self, state: &mut MessageState, now: i64) -> Result<Option<i64>> {
        if !self.is_scheduled() {
            return Ok(None);
        }

        if self.delay > 0 && !state.schedule_delay_applied {
            state.schedule_delay_applied = true;
            return Ok(Some(now + millis(self.delay)));
        }

        if let Some(last) = state.last_scheduled_at {
            if self.repeat > 0 && state.schedule_repeat_count < self.repeat {
                state.schedule_repeat_count += 1;
                return Ok(Some(last + millis(self.repeat_period)));
            }
        }

        if let Some(expression) = &self.cron {
            let schedule = parse_cron(expression)?;
            let after = DateTime::<Utc>::from_timestamp_millis(now.max(
                state.last_scheduled_at.unwrap_or(now),
            ))
            .unwrap_or_else(Utc::now);
            state.schedule_cron_fired = true;
            state.schedule_repeat_count = 0;
            return Ok(schedule
                .after(&after)
                .next()
                .map(|next| next.timestamp_millis()));
        }

        if self.repeat > 0 && state.last_scheduled_at.is_none() {
            return Ok(Some(now));
        }

        Ok(None)
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|error| Error::InvalidSchedule {
        reason: format!("invalid cron expression {expression:?}: {error}"),
    })
}

fn millis(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }
