use std::time::Duration;

/// Exponential backoff between task attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Delay to wait after the zero-based `attempt` failed.
    ///
    /// With the defaults (1s, x2) this yields 1s, 2s, 4s, ...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if delay_secs.is_nan() || delay_secs < 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Minimum wall-clock time spent in backoff before attempt `failures + 1`.
    pub fn total_delay(&self, failures: u32) -> Duration {
        (0..failures).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.next_delay(attempt))
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0)
    }
}
