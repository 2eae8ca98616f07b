//! Per-task retry policy and the errors a job body can report.
//!
//! A task carries its own [`RetryPolicy`]. When the body fails with a
//! [`JobError::Failed`] whose `kind` is listed in `retry_on`, the worker puts
//! the task back in the queue with a delay from [`BackoffPolicy`] until
//! `max_retries` is exhausted. [`JobError::Repeat`] is not a failure at all:
//! the task is re-queued immediately, without touching the retry budget.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind recorded when a job body panics.
pub const PANIC_KIND: &str = "panic";

/// What a job body reports back to the worker when it does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Cooperative "run me again" signal. Re-queued with no backoff and no
    /// retry-count check.
    #[error("repeat requested")]
    Repeat,

    /// The body failed. `kind` is matched against [`RetryPolicy::retry_on`].
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
}

impl JobError {
    pub fn repeat() -> Self {
        JobError::Repeat
    }

    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The failure kind, or `None` for [`JobError::Repeat`].
    pub fn kind(&self) -> Option<&str> {
        match self {
            JobError::Repeat => None,
            JobError::Failed { kind, .. } => Some(kind),
        }
    }
}

/// Delay growth between retries.
///
/// The delay for retry `n` (0-indexed) is `first × factor^n`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 1.0,
        }
    }
}

impl BackoffPolicy {
    /// Same delay for every retry.
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let max_secs = self.max.as_secs_f64();

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry behaviour carried by each task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Failure kinds that may be retried. Everything else fails the task.
    pub retry_on: BTreeSet<String>,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    /// No retries: the first failure marks the task failed.
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_on: BTreeSet::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.insert(kind.into());
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a failure should be retried, given the retries already spent.
    /// Repeats are not retries and never count here.
    pub fn should_retry(&self, error: &JobError, retries: u32) -> bool {
        match error.kind() {
            Some(kind) => self.retry_on.contains(kind) && retries < self.max_retries,
            None => false,
        }
    }

    /// Delay before the next retry, given the retries already spent.
    pub fn delay_for(&self, retries: u32) -> Duration {
        self.backoff.next(retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_clamps() {
        let backoff = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next(0), Duration::from_millis(100));
        assert_eq!(backoff.next(1), Duration::from_millis(200));
        assert_eq!(backoff.next(3), Duration::from_millis(800));
        assert_eq!(backoff.next(4), Duration::from_secs(1));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn constant_backoff_never_changes() {
        let backoff = BackoffPolicy::constant(Duration::from_millis(250));
        for attempt in 0..8 {
            assert_eq!(backoff.next(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&JobError::failed("io", "boom"), 0));
    }

    #[test]
    fn retries_only_listed_kinds_within_budget() {
        let policy = RetryPolicy::new(2).retry_on("timeout");

        assert!(policy.should_retry(&JobError::failed("timeout", "slow"), 0));
        assert!(policy.should_retry(&JobError::failed("timeout", "slow"), 1));
        assert!(!policy.should_retry(&JobError::failed("timeout", "slow"), 2));
        assert!(!policy.should_retry(&JobError::failed("parse", "bad"), 0));
        assert!(!policy.should_retry(&JobError::Repeat, 0));
    }

    #[test]
    fn first_retry_uses_first_delay() {
        let policy = RetryPolicy::new(3)
            .backoff(BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10)));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }
}
