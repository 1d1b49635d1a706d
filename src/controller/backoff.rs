//! # Exponential Backoff
//!
//! Retry delays for transient reconciliation failures.
//!
//! Each attempt doubles the delay starting from `min`, capped at `max`, then
//! scales it by a random factor in `[1 - jitter, 1 + jitter]` so that keys
//! failing together do not retry together. The jittered value never exceeds `max`.
//!
//! ## Usage
//!
//! ```rust
//! use job_operator::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(2));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(4));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! ```

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    /// Fraction of the delay applied as jitter, in `[0, 1]`
    jitter: f64,
    /// Delays handed out since the last reset
    attempt: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) },
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, advancing the sequence
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// [`Self::next_delay`] with an explicit random source
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max)
    }

    /// Un-jittered delay for `attempt`
    fn base_delay(&self, attempt: u32) -> Duration {
        // 2^31 * min already overflows any sane max
        let multiplier = 2u32.saturating_pow(attempt.min(31));
        self.min
            .checked_mul(multiplier)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Back to the minimum delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
