//! Retryable-operation abstraction shared by the fetcher and the summarizer.
//!
//! # Backoff Strategy
//!
//! The delay between attempts follows:
//! ```text
//! delay = min(max(base_delay * 2^(attempt-1), hint), max_delay) + random_jitter(0..=jitter)
//! ```
//! where `hint` is an optional server-provided retry-after value.

use rand::{Rng, rng};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, warn};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again, optionally waiting at least `hint`.
    Retry { hint: Option<Duration> },
    /// The error is terminal for this operation.
    GiveUp,
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: usize,
    /// Initial delay between attempts (doubles with each failure).
    pub base_delay: Duration,
    /// Upper bound for a single wait.
    pub max_delay: Duration,
    /// Upper bound of random jitter added to each wait.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before the next attempt, given the number of failures so far (1-based).
    pub fn delay_for(&self, failures: usize, hint: Option<Duration>) -> Duration {
        let shift = failures.saturating_sub(1).min(16) as u32;
        let backoff = self.base_delay.saturating_mul(1u32 << shift);
        let wanted = match hint {
            Some(h) => backoff.max(h),
            None => backoff,
        };
        wanted.min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..=max_ms))
    }

    /// Run `op` until it succeeds, `classify` says give up, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let attempt_t0 = Instant::now();
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let hint = match classify(&err) {
                RetryDecision::GiveUp => {
                    warn!(label, attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                RetryDecision::Retry { hint } => hint,
            };

            if attempt >= max_attempts {
                error!(
                    label,
                    attempt,
                    max = max_attempts,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %err,
                    "exhausted retries"
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt, hint) + self.jitter();
            warn!(
                label,
                attempt,
                max = max_attempts,
                elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
                ?delay,
                error = %err,
                "attempt failed; backing off"
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6, None), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_honors_hint() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(12))),
            Duration::from_secs(12)
        );
        // a hint below the backoff does not shorten the wait
        assert_eq!(
            policy.delay_for(3, Some(Duration::from_millis(10))),
            Duration::from_secs(4)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<&str, String> = quick_policy(3)
            .run(
                "test",
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move {
                        if attempt < 3 {
                            Err(format!("boom {attempt}"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| RetryDecision::Retry { hint: None },
            )
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = quick_policy(2)
            .run(
                "test",
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err("down".to_string()) }
                },
                |_| RetryDecision::Retry { hint: None },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), String> = quick_policy(5)
            .run(
                "test",
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err("404".to_string()) }
                },
                |_| RetryDecision::GiveUp,
            )
            .await;
        assert_eq!(result, Err("404".to_string()));
        assert_eq!(calls.get(), 1);
    }
}
