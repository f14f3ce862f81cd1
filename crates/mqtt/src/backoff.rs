//! Banded backoff for the reconnect cycle.
//!
//! A reconnect cycle does not grow its delay geometrically. It walks through
//! three fixed bands keyed on how many attempts the cycle has already made:
//!
//! ```text
//! attempts made | wait before next attempt
//! --------------+-------------------------
//!             0 | 0s  (first attempt of a cycle is immediate)
//!          1..=3 | short  (default 2s)
//!          4..=6 | medium (default 10s)
//!            7+ | long   (default 60s, capped)
//! ```
//!
//! The schedule itself is a pure function ([`BackoffSchedule::delay_for`]).
//! [`Backoff`] wraps it with an attempt counter and a hard attempt limit so the
//! engine can drive a cycle with `next_sleep()` until it returns an error.
//!
//! # Examples
//!
//! ```ignore
//! let mut backoff = Backoff::new(BackoffSchedule::default());
//!
//! assert_eq!(backoff.next_sleep()?, Duration::ZERO);
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(2));
//! ```

use std::time::Duration;

use thiserror::Error;

use super::config::ReconnectConfig;

/// Error type for backoff exhaustion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// Maximum attempts of one cycle were used up. Carries the configured limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Pure mapping from "attempts already made in this cycle" to a wait duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    short_delay: Duration,
    medium_delay: Duration,
    long_delay: Duration,

    /// Attempts after which the medium band applies.
    medium_after: u32,

    /// Attempts after which the long band applies.
    long_after: u32,

    /// Hard limit on attempts per cycle.
    max_attempts: u32,
}

impl BackoffSchedule {
    pub fn new(
        short_delay: Duration,
        medium_delay: Duration,
        long_delay: Duration,
        medium_after: u32,
        long_after: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            short_delay,
            medium_delay,
            long_delay,
            medium_after,
            long_after,
            max_attempts,
        }
    }

    /// Builds the schedule from the reconnect section of the configuration.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_secs(config.short_delay),
            Duration::from_secs(config.medium_delay),
            Duration::from_secs(config.long_delay),
            config.medium_after,
            config.long_after,
            config.max_attempts,
        )
    }

    /// Wait before the next attempt, given how many attempts the cycle already made.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            Duration::ZERO
        } else if attempts_made > self.long_after {
            self.long_delay
        } else if attempts_made > self.medium_after {
            self.medium_delay
        } else {
            self.short_delay
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Attempt counter for a single reconnect cycle.
///
/// Each cycle gets a fresh `Backoff`, so its first `next_sleep()` is always
/// zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: BackoffSchedule,

    /// Attempts handed out so far in this cycle.
    attempt: u32,
}

impl Backoff {
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            attempt: 0,
        }
    }

    /// Returns the wait before the next attempt and counts that attempt.
    ///
    /// # Returns
    /// - `Ok(Duration)`: sleep this long, then attempt
    /// - `Err(BackoffError)`: the cycle has used all of its attempts
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if self.attempt >= self.schedule.max_attempts {
            return Err(BackoffError::MaxAttemptLimitError(
                self.schedule.max_attempts,
            ));
        }

        let sleep = self.schedule.delay_for(self.attempt);
        self.attempt += 1;
        Ok(sleep)
    }

    /// Attempts counted so far in this cycle.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffSchedule::default())
    }
}
