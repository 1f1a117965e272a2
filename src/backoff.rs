//! Jittered exponential backoff for retry and reconnect loops.
//!
//! Each step yields `base^increment + jitter_multiplier * r` seconds, with `r` uniform in
//! `[0, 1)`, then bumps `increment`. Once a value would reach `maximum` the generator reports
//! [`RateLimitError::BackoffExhausted`] and the caller should give up.
//!
//! ```rust
//! use bucketeer::ExponentialBackOff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackOff::new(2.0, 10.0, 0.0).unwrap();
//! let delays: Vec<Duration> = backoff.by_ref().collect();
//! assert_eq!(delays, [1, 2, 4, 8].map(Duration::from_secs));
//!
//! backoff.reset();
//! assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
//! ```
//!
//! The generator is plain state; it never sleeps. Clone it to hand each connection its own
//! sequence.

use crate::RateLimitError;
use rand::Rng;
use std::time::Duration;

/// Stateful exponential delay generator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackOff {
    base: f64,
    maximum: f64,
    jitter_multiplier: f64,
    increment: u32,
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self { base: 2.0, maximum: 64.0, jitter_multiplier: 1.0, increment: 0 }
    }
}

impl ExponentialBackOff {
    /// Create a generator with validation.
    ///
    /// All values are in seconds. `base` and `jitter_multiplier` must be finite and non-negative;
    /// `maximum` must be finite and positive.
    pub fn new(base: f64, maximum: f64, jitter_multiplier: f64) -> Result<Self, RateLimitError> {
        if !base.is_finite() || base < 0.0 {
            return Err(RateLimitError::invalid("base", "must be a finite, non-negative number"));
        }
        if !maximum.is_finite() || maximum <= 0.0 {
            return Err(RateLimitError::invalid("maximum", "must be a finite, positive number"));
        }
        if !jitter_multiplier.is_finite() || jitter_multiplier < 0.0 {
            return Err(RateLimitError::invalid(
                "jitter_multiplier",
                "must be a finite, non-negative number",
            ));
        }
        Ok(Self { base, maximum, jitter_multiplier, increment: 0 })
    }

    /// Start the sequence at `base^increment` instead of `base^0`.
    pub fn with_initial_increment(mut self, increment: u32) -> Self {
        self.increment = increment;
        self
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    pub fn jitter_multiplier(&self) -> f64 {
        self.jitter_multiplier
    }

    /// Exponent used by the next step.
    pub fn increment(&self) -> u32 {
        self.increment
    }

    /// Next delay, jittered with the thread-local RNG.
    pub fn next_delay(&mut self) -> Result<Duration, RateLimitError> {
        self.next_delay_with_rng(&mut rand::rng())
    }

    /// Next delay, jittered with the supplied RNG.
    ///
    /// The increment advances even when the result is `BackoffExhausted`.
    pub fn next_delay_with_rng<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<Duration, RateLimitError> {
        let increment = self.increment;
        self.increment = self.increment.saturating_add(1);

        let exponent = i32::try_from(increment).unwrap_or(i32::MAX);
        let mut value = self.base.powi(exponent);
        if self.jitter_multiplier > 0.0 {
            value += self.jitter_multiplier * rng.random::<f64>();
        }

        if !value.is_finite() || value >= self.maximum {
            return Err(RateLimitError::BackoffExhausted { increment, maximum: self.maximum });
        }
        Duration::try_from_secs_f64(value)
            .map_err(|_| RateLimitError::BackoffExhausted { increment, maximum: self.maximum })
    }

    /// Restart the sequence from `base^0`.
    pub fn reset(&mut self) {
        self.increment = 0;
    }
}

/// Yields delays until the backoff is exhausted.
impl Iterator for ExponentialBackOff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_delay().ok()
    }
}
