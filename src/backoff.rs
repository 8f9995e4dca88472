//! Exponential backoff between connection attempts.
//!
//! Attempt `k` (0-indexed) waits `min(initial * 2^k, max)` before the next
//! attempt, and at most `max_retries` retries follow the first attempt:
//!
//! ```text
//! attempt:  0      1      2      3      4      5      6
//! delay:    50ms   100ms  200ms  400ms  800ms  1000ms 1000ms
//! ```
//!
//! The policy is a pure value: it holds no counters, callers pass the attempt
//! index they are on.

use std::time::Duration;

/// Delay before the first retry.
pub const RETRY_PAUSE_START: Duration = Duration::from_millis(50);

/// Upper bound for any single retry delay.
pub const RETRY_PAUSE_MAX: Duration = Duration::from_millis(1000);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    RetryAfter(Duration),
    /// No retries left.
    GiveUp,
}

/// Capped exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(RETRY_PAUSE_START, RETRY_PAUSE_MAX, 2)
    }
}

impl BackoffPolicy {
    /// Create a policy.
    ///
    /// If `max` is smaller than `initial`, every delay is `max`.
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            max_retries,
        }
    }

    /// Same delays, different retry budget.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what follows the failure of attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay(attempt))
        }
    }

    /// Delay after attempt `attempt`, ignoring the retry budget.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Every delay this policy will produce, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(move |attempt| self.delay(attempt))
    }
}
