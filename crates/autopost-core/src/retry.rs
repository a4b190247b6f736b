//! Retry/backoff policy.
//!
//! A failed job either goes back to a claimable state or fails terminally.
//! Requeued jobs carry a `not_before` so an unavailable collaborator is not
//! hammered by the poll loop.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to its waiting state; claimable again from `not_before`.
    Requeue { not_before: Option<DateTime<Utc>> },
    /// Retries are exhausted.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure. Zero disables pacing.
    pub backoff_base: Duration,
    /// Upper bound for the doubling delay.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Policy without any delay between attempts.
    pub fn immediate() -> Self {
        Self {
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Decide what happens after a failure.
    ///
    /// `retry_count` is the number of retries consumed before the failure
    /// being handled. A job may be retried `max_retries` times; the failure
    /// after that is terminal.
    pub fn decide(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count >= max_retries {
            return RetryDecision::Terminate;
        }

        let delay = self.delay(retry_count.saturating_add(1));
        let not_before = if delay.is_zero() {
            None
        } else {
            TimeDelta::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
        };
        RetryDecision::Requeue { not_before }
    }

    /// Exponential delay `base * 2^(attempt - 1)`, capped at `backoff_max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.backoff_base.is_zero() {
            return Duration::ZERO;
        }

        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.backoff_base.saturating_mul(1u32 << exp);
        scaled.min(self.backoff_max.max(self.backoff_base))
    }
}
