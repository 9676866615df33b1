//! Exponential backoff with jitter for provider retries.

use rand::Rng;
use std::time::Duration;

/// Backoff parameters for retries within a single gateway invocation.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Jitter factor (0.0-1.0); each delay is scaled by `1 ± jitter`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            multiplier: 2.0,
            max: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based) without jitter, capped at `max`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            policy: self.clone(),
            attempt: 0,
            previous: Duration::ZERO,
        }
    }
}

/// Successive delays for one invocation. Delays never decrease, even when
/// jitter would pull a capped delay below its predecessor.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    policy: BackoffPolicy,
    attempt: u32,
    previous: Duration,
}

impl BackoffSchedule {
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.policy.nominal_delay(self.attempt).as_secs_f64();
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let scaled = if jitter > 0.0 {
            nominal * (1.0 + rand::rng().random_range(-jitter..=jitter))
        } else {
            nominal
        };

        let capped = Duration::from_secs_f64(scaled.min(self.policy.max.as_secs_f64()).max(0.0));
        let delay = capped.max(self.previous);

        self.previous = delay;
        self.attempt += 1;
        delay
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
