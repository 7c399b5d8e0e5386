use std::time::Duration;

use chrono::{DateTime, Days, TimeDelta, TimeZone, Utc};

use crate::models::CoreError;

/// When a scheduled job fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Schedule {
    /// Every `Duration`, measured from the previous tick.
    Interval(Duration),
    /// Once a day at `hour:minute` UTC.
    Daily { hour: u32, minute: u32 },
}

impl Schedule {
    pub fn interval(every: Duration) -> Result<Self, CoreError> {
        if every.is_zero() {
            return Err(CoreError::invalid_input(
                "schedule interval must be greater than zero",
            ));
        }
        Ok(Schedule::Interval(every))
    }

    pub fn daily(hour: u32, minute: u32) -> Result<Self, CoreError> {
        if hour >= 24 || minute >= 60 {
            return Err(CoreError::invalid_input(format!(
                "invalid daily schedule time {hour:02}:{minute:02}"
            )));
        }
        Ok(Schedule::Daily { hour, minute })
    }

    /// Time to wait from `now` until the next tick.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Schedule::Interval(every) => every,
            Schedule::Daily { hour, minute } => {
                let Some(next) = next_daily_run(now, hour, minute) else {
                    return Duration::from_secs(24 * 3600);
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }

    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = TimeDelta::from_std(self.delay_from(now)).ok()?;
        now.checked_add_signed(delay)
    }
}

fn next_daily_run(now: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
    let candidate = Utc.from_utc_datetime(&today);
    if candidate > now {
        Some(candidate)
    } else {
        candidate.checked_add_days(Days::new(1))
    }
}
