//! Resilience patterns for outbound service calls
//!
//! Every outbound adapter call passes through a rate limiter, then a circuit
//! breaker check on each attempt, then retry with exponential backoff. An
//! open circuit rejects before the rate limiter is consulted.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitOpen, CircuitState,
};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::RetryPolicy;

use opshub_core::{AdapterSettings, CallContext, ContextStoreError, HubMetrics, Interruption};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Classifies an error as transient (worth retrying) or final.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ContextStoreError {
    fn is_retryable(&self) -> bool {
        ContextStoreError::is_retryable(self)
    }
}

pub type ResilienceResult<T, E> = std::result::Result<T, ResilienceError<E>>;

/// Errors that can occur in resilient operations
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Circuit breaker is open
    CircuitOpen,
    /// No rate limit token became available in time
    RateLimited,
    /// The caller's context was cancelled or hit its deadline
    Interrupted(Interruption),
    /// All attempts failed with transient errors
    Exhausted { attempts: u32, last: E },
    /// The operation failed with a non-retryable error
    Failed(E),
}

impl<E> ResilienceError<E> {
    /// The operation's own error, if it got far enough to produce one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Exhausted { last, .. } | ResilienceError::Failed(last) => Some(last),
            _ => None,
        }
    }
}

impl<E> From<Interruption> for ResilienceError<E> {
    fn from(reason: Interruption) -> Self {
        ResilienceError::Interrupted(reason)
    }
}

impl<E> From<RateLimitError> for ResilienceError<E> {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exhausted(_) => ResilienceError::RateLimited,
            RateLimitError::Interrupted(reason) => ResilienceError::Interrupted(reason),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResilienceError::CircuitOpen => write!(f, "Circuit breaker is open"),
            ResilienceError::RateLimited => write!(f, "Rate limit exceeded"),
            ResilienceError::Interrupted(reason) => write!(f, "Operation interrupted: {}", reason),
            ResilienceError::Exhausted { attempts, last } => {
                write!(f, "Retries exhausted after {} attempts: {}", attempts, last)
            }
            ResilienceError::Failed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Exhausted { last, .. } | ResilienceError::Failed(last) => Some(last),
            ResilienceError::Interrupted(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Rate limiter, circuit breaker and retry policy for one service.
#[derive(Clone)]
pub struct Resilience {
    name: String,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry: RetryPolicy,
    metrics: Option<Arc<HubMetrics>>,
}

impl Resilience {
    pub fn new(
        name: impl Into<String>,
        rate_limiter: RateLimiter,
        circuit_breaker: CircuitBreaker,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            rate_limiter,
            circuit_breaker,
            retry,
            metrics: None,
        }
    }

    /// Build from adapter settings, sharing the given breaker.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &AdapterSettings,
        circuit_breaker: CircuitBreaker,
    ) -> Self {
        Self::new(
            name,
            RateLimiter::from_settings(&settings.rate_limit),
            circuit_breaker,
            RetryPolicy::from_settings(&settings.retry),
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute an operation with rate limiting, circuit breaking and retry.
    ///
    /// Transient failures count against the breaker and are retried with
    /// backoff. Non-retryable failures return at once and never count.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &CallContext, mut operation: F) -> ResilienceResult<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.circuit_breaker.is_rejecting() {
            debug!(service = %self.name, "Circuit open, skipping rate limiter");
            return Err(ResilienceError::CircuitOpen);
        }

        if let Err(err) = self.rate_limiter.acquire(ctx).await {
            if matches!(err, RateLimitError::Exhausted(_)) {
                warn!(service = %self.name, "Rate limit exceeded");
                if let Some(metrics) = &self.metrics {
                    metrics.rate_limited.inc();
                }
            }
            return Err(err.into());
        }

        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;

            let permit = self
                .circuit_breaker
                .try_acquire()
                .map_err(|_| ResilienceError::CircuitOpen)?;

            match ctx.run(operation()).await {
                Err(reason) => {
                    permit.release();
                    return Err(ResilienceError::Interrupted(reason));
                }
                Ok(Ok(value)) => {
                    permit.success();
                    return Ok(value);
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    permit.release();
                    return Err(ResilienceError::Failed(e));
                }
                Ok(Err(e)) => {
                    permit.failure();
                    if attempt >= max_attempts {
                        warn!(
                            service = %self.name,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(ResilienceError::Exhausted { attempts: attempt, last: e });
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        service = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.retries.inc();
                    }
                    ctx.sleep(delay).await?;
                }
            }
        }
    }
}
