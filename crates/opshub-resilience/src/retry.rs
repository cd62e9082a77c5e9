//! Retry policies
//!
//! Exponential backoff with a fixed multiplier of 2.

use opshub_core::{CallContext, RetrySettings};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{ResilienceError, ResilienceResult, Retryable};

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Immutable retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.0 disables)
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay()).with_max_delay(settings.max_delay())
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-indexed):
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(31) as i32;
        let delay = self
            .base_delay
            .mul_f64(BACKOFF_MULTIPLIER.powi(exponent))
            .min(self.max_delay);

        if self.jitter_factor > 0.0 {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.mul_f64(self.jitter_factor);
        if jitter_range.is_zero() {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..jitter_range);

        if rng.gen_bool(0.5) {
            (delay + jitter).min(self.max_delay)
        } else {
            delay.saturating_sub(jitter)
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts or `ctx` ends.
    pub async fn retry<T, E, F, Fut>(&self, ctx: &CallContext, mut operation: F) -> ResilienceResult<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match ctx.run(operation()).await? {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(ResilienceError::Failed(e)),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        return Err(ResilienceError::Exhausted { attempts: attempt, last: e });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after transient failure");
                    ctx.sleep(delay).await?;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl std::error::Error for TestError {}

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(0.5);

        for _ in 0..100 {
            assert!(policy.delay_for_attempt(1) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_from_settings() {
        let policy = RetryPolicy::from_settings(&RetrySettings::new(4, 10));
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: ResilienceResult<&str, TestError> = policy
            .retry(&CallContext::new(), || {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(TestError { retryable: true })
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: ResilienceResult<(), TestError> = policy
            .retry(&CallContext::new(), || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retryable: true })
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Exhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let result: ResilienceResult<(), TestError> = policy
            .retry(&CallContext::new(), || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retryable: false })
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Failed(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_backoff() {
        let ctx = CallContext::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: ResilienceResult<(), TestError> = policy
            .retry(&ctx, || async { Err(TestError { retryable: true }) })
            .await;

        assert!(matches!(result, Err(ResilienceError::Interrupted(_))));
    }
}
