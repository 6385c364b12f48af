//! Retry with exponential backoff for transient producer failures.
//!
//! The consumer side never retries on its own; redelivery is the broker's job.
//! This module serves the producer, where a [`ConnectionError`] may be retried
//! with a fresh envelope per attempt.
//!
//! [`ConnectionError`]: booking_relay_core::event_bus::PublishError::Connection
//!
//! # Example
//!
//! ```rust
//! use booking_relay_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(10));
//!
//! let retried = retry_with_predicate(&policy, || async { Ok::<_, String>(42) }, |_| true).await;
//! assert_eq!(retried.result, Ok(42));
//! assert_eq!(retried.attempts, 1);
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (including the first)
/// - `initial_delay`: 100ms
/// - `max_delay`: 5 seconds
/// - `backoff_multiplier`: 2.0
/// - jitter: on
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Create a policy with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set maximum attempts, including the first. Zero is treated as one.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between retries.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disable jitter, making delays deterministic.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        if self.max_attempts == 0 { 1 } else { self.max_attempts }
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// `min(initial_delay * multiplier^attempt, max_delay)`, scaled by a random
    /// factor in `[0.5, 1.0]` when jitter is on.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(capped_secs * factor).unwrap_or(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a retried operation with the number of attempts made.
#[derive(Debug)]
pub struct Retried<T, E> {
    /// Final result: the first success, the first non-retryable error, or the
    /// last error once attempts ran out
    pub result: Result<T, E>,
    /// Attempts made, at least one
    pub attempts: u32,
}

/// Retry `operation` while `is_retryable` accepts its error.
///
/// Each call to `operation` must start from scratch; callers that publish
/// build a fresh envelope inside it.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Retried<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    RetryMetrics::record_success();
                    tracing::info!(attempts, "Operation succeeded after retry");
                }
                return Retried {
                    result: Ok(value),
                    attempts,
                };
            },
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(error = %err, "Error is not retryable, failing immediately");
                    return Retried {
                        result: Err(err),
                        attempts,
                    };
                }

                if attempts >= policy.max_attempts() {
                    RetryMetrics::record_exhausted();
                    tracing::error!(attempts, error = %err, "Operation failed after max attempts");
                    return Retried {
                        result: Err(err),
                        attempts,
                    };
                }

                let delay = policy.delay_for_attempt(attempts - 1);
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter()
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::new().with_initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let retried = retry_with_predicate(
            &fast().with_max_attempts(3),
            || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(retried.result, Ok(7));
        assert_eq!(retried.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let retried = retry_with_predicate(
            &fast().with_max_attempts(2),
            || async { Err::<(), _>("still down") },
            |_| true,
        )
        .await;

        assert_eq!(retried.result, Err("still down"));
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let retried = retry_with_predicate(
            &fast().with_max_attempts(5),
            || async { Err::<(), _>("permanent") },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert_eq!(retried.result, Err("permanent"));
        assert_eq!(retried.attempts, 1);
    }
}
