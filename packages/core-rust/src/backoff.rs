//! Retry policy and exponential backoff arithmetic.
//!
//! The delay before retry `n` (0-indexed) is
//! `min(max_delay, base_delay * multiplier^n)`. With jitter enabled the
//! executor replaces it with a value drawn uniformly from `[0, delay]`
//! ("full jitter"), which spreads retries from many callers instead of letting
//! them fire in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Errors from validating a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts must be >= 1")]
    ZeroAttempts,
    #[error("multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxBelowBase { base: Duration, max: Duration },
}

/// Immutable retry configuration, shared by every call that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a validated policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when any field is out of range.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter: bool,
    ) -> Result<Self, PolicyError> {
        let policy = Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
            jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that performs exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Checks the field invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(self.multiplier));
        }
        if self.max_delay < self.base_delay {
            return Err(PolicyError::MaxBelowBase {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    #[must_use]
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Deterministic (un-jittered) delay before retrying after `attempt` failed.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let max_nanos = self.max_delay.as_nanos() as f64;
        let nanos = (self.base_delay.as_nanos() as f64 * factor).round();
        // Overflowed or NaN products collapse onto the cap.
        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Delay to actually wait, applying full jitter when enabled.
    pub fn sample_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.random_range(0..=nanos))
    }

    /// The un-jittered delays between consecutive attempts, in order.
    ///
    /// Yields `max_attempts - 1` values.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|n| self.delay_for_attempt(n))
    }
}
