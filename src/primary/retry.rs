//! Retrying backend calls with exponential backoff and jitter.

use super::backend::BackendError;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Retry policy for backend calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, after `failures` failed attempts.
    ///
    /// `initial * factor^(failures - 1)` capped at the maximum, plus up to the
    /// same amount again of random jitter, capped again.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base = (self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent))
            .min(self.max_backoff_ms as f64) as u64;
        let jitter = rand::random::<u64>() % base.max(1);
        Duration::from_millis(base.saturating_add(jitter).min(self.max_backoff_ms))
    }
}

/// Time budget of one batch operation.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Instant>,
    call_timeout: Duration,
}

impl Deadline {
    pub fn new(at: Instant, call_timeout: Duration) -> Self {
        Self {
            at: Some(at),
            call_timeout,
        }
    }

    /// Calls are bounded only by the per-call timeout.
    pub fn unbounded(call_timeout: Duration) -> Self {
        Self {
            at: None,
            call_timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Timeout for the next call: the per-call timeout capped by what is left.
    pub fn next_call(&self, operation: &'static str) -> Result<Duration> {
        match self.at {
            None => Ok(self.call_timeout),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(StoreError::DeadlineExceeded(operation))
                } else {
                    Ok(left.min(self.call_timeout))
                }
            }
        }
    }

    /// Sleep for `delay`, failing instead if the deadline would pass first.
    pub fn sleep(&self, delay: Duration, operation: &'static str) -> Result<()> {
        if let Some(at) = self.at {
            if Instant::now() + delay >= at {
                return Err(StoreError::DeadlineExceeded(operation));
            }
        }
        std::thread::sleep(delay);
        Ok(())
    }
}

/// Run `f` until it succeeds, fails permanently, or attempts run out.
///
/// `f` receives the timeout for its call. Retryable errors are retried after
/// [`RetryPolicy::backoff`]; permanent errors and exhausted retries become
/// [`StoreError::PrimaryUnavailable`].
pub fn with_retry<T>(
    policy: &RetryPolicy,
    deadline: &Deadline,
    operation: &'static str,
    mut f: impl FnMut(Duration) -> std::result::Result<T, BackendError>,
) -> Result<T> {
    let mut attempts = 0u32;

    loop {
        let timeout = deadline.next_call(operation)?;
        attempts += 1;

        match f(timeout) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts < policy.max_attempts => {
                let delay = policy.backoff(attempts);
                tracing::warn!(
                    "{operation}: transient error (attempt {}/{}), retrying in {:?}: {e}",
                    attempts,
                    policy.max_attempts,
                    delay,
                );
                deadline.sleep(delay, operation)?;
            }
            Err(e) => {
                return Err(StoreError::PrimaryUnavailable {
                    operation,
                    attempts,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_factor: 2.0,
        };
        for _ in 0..20 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
            assert!(policy.backoff(3) >= Duration::from_millis(40));
            assert!(policy.backoff(30) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let deadline = Deadline::unbounded(Duration::from_secs(1));
        let mut calls = 0;
        let value = with_retry(&fast_policy(3), &deadline, "query", |_| {
            calls += 1;
            if calls < 3 {
                Err(BackendError::Throttled("busy".into()))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn exhausted_retries_are_unavailable() {
        let deadline = Deadline::unbounded(Duration::from_secs(1));
        let mut calls = 0;
        let err = with_retry(&fast_policy(3), &deadline, "query", |_| -> std::result::Result<(), _> {
            calls += 1;
            Err(BackendError::Unavailable("down".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(
            err,
            StoreError::PrimaryUnavailable { attempts: 3, operation: "query", .. }
        ));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let deadline = Deadline::unbounded(Duration::from_secs(1));
        let mut calls = 0;
        let err = with_retry(&fast_policy(5), &deadline, "batch_write", |_| -> std::result::Result<(), _> {
            calls += 1;
            Err(BackendError::Validation("item too large".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, StoreError::PrimaryUnavailable { attempts: 1, .. }));
    }

    #[test]
    fn expired_deadline_stops_before_calling() {
        let deadline = Deadline::new(Instant::now(), Duration::from_secs(1));
        let mut calls = 0;
        let err = with_retry(&fast_policy(5), &deadline, "query", |_| {
            calls += 1;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(calls, 0);
        assert!(matches!(err, StoreError::DeadlineExceeded("query")));
    }

    #[test]
    fn call_timeout_is_capped_by_deadline() {
        let deadline = Deadline::new(
            Instant::now() + Duration::from_millis(200),
            Duration::from_secs(10),
        );
        assert!(deadline.next_call("query").unwrap() <= Duration::from_millis(200));
        assert!(!deadline.is_expired());
    }
}
