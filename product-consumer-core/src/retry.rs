use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay between two attempts against the downstream API.
///
/// The delay before retry `n` (1-based) is `initial_interval * factor^(n - 1)`, randomized by
/// `jitter` and capped at `max_interval`. A zero `initial_interval` yields zero delays.
pub(crate) struct Backoff {
    initial_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    attempt: u16,
}

impl Backoff {
    pub(crate) fn new(config: &RetryConfig) -> Self {
        Self {
            initial_interval: config.initial_interval,
            max_interval: config.max_interval,
            factor: config.factor,
            jitter: config.jitter,
            attempt: 0,
        }
    }

    fn delay(&self, attempt: u16) -> Duration {
        if self.initial_interval.is_zero() {
            return Duration::ZERO;
        }

        // attempt is at least 1 here, powi(-1) would shrink the delay
        let exponent = i32::from(attempt.max(1) - 1);
        let base_ms = self.initial_interval.as_millis() as f64 * self.factor.powi(exponent);

        let delay_ms = if self.jitter == 0.0 {
            base_ms
        } else {
            base_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };

        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    // never ends, the attempt loop owns the retry bound
    fn next(&mut self) -> Option<Self::Item> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}
