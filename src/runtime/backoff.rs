// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backoff strategies for failed reconciles.
//!
//! When a reconcile returns an error the runtime re-enqueues the primary
//! after a delay computed from the per-pointer attempt counter. The counter
//! resets on the first successful pass.

use std::time::Duration;

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Calculate the delay before the next retry attempt.
    ///
    /// # Arguments
    /// * `attempt` - The current attempt number (0-indexed)
    fn delay(&self, attempt: u32) -> Duration;
}

/// No delay between retries. Used by tests to keep scenarios fast.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Fixed delay between retries.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new fixed backoff strategy.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff - delay doubles with each attempt.
///
/// Optionally includes jitter to prevent thundering herd.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% on top of the capped delay.
            let jitter_range = capped_delay * 0.25;
            capped_delay + rand::random::<f64>() * jitter_range
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_backoff() {
        assert_eq!(NoBackoff.delay(0), Duration::ZERO);
        assert_eq!(NoBackoff.delay(100), Duration::ZERO);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::new(Duration::from_millis(250));
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(5), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100)).with_jitter(false);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(false);
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100));
        for attempt in 0..5 {
            let base = ExponentialBackoff::new(Duration::from_millis(100))
                .with_jitter(false)
                .delay(attempt);
            let jittered = backoff.delay(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base.mul_f64(0.26));
        }
    }
}
