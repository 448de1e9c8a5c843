//! Backoff schedule and attempt budget for automatic reconnection.

use std::time::Duration;

use rand::Rng;

/// Each consecutive attempt doubles the base delay.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Upper bound on the jitter fraction added to a delay.
pub const MAX_JITTER: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive connection losses tolerated before giving up.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 0.25]`; out-of-range values are clamped.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: MAX_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial_delay * 2^(attempt-1), max_delay)`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Base delay scaled by `1 + jitter`, where `jitter` is the sample already
    /// drawn from `[0, self.jitter)`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        self.base_delay(attempt).mul_f64(1.0 + jitter.clamp(0.0, MAX_JITTER))
    }

    /// Delay before the reconnect that follows the `attempt`-th loss.
    pub fn delay(&self, attempt: u32) -> Duration {
        let fraction = self.jitter.clamp(0.0, MAX_JITTER);
        let sample = if fraction > 0.0 {
            rand::rng().random_range(0.0..fraction)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, sample)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
