//! Token-bucket rate limiting for outbound calls.

use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use opshub_core::{CallContext, Interruption, RateLimitSettings};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, no token within {0:?}")]
    Exhausted(Duration),
    #[error(transparent)]
    Interrupted(#[from] Interruption),
}

/// Token bucket shared by every call to one service.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DirectLimiter>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, burst: u32, max_wait: Duration) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: Arc::new(governor::RateLimiter::direct(quota)),
            max_wait,
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.requests_per_second, settings.burst, settings.max_wait())
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Take a token, waiting up to `max_wait` for one to become available.
    ///
    /// A wait that cannot finish within the budget fails straight away.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<(), RateLimitError> {
        let give_up_at = Instant::now() + self.max_wait;
        loop {
            if let Some(reason) = ctx.interruption() {
                return Err(reason.into());
            }

            let wait = match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until.wait_time_from(DefaultClock::default().now()),
            };

            let now = Instant::now();
            if now >= give_up_at || now + wait > give_up_at {
                return Err(RateLimitError::Exhausted(self.max_wait));
            }
            ctx.sleep(wait.max(Duration::from_millis(1))).await?;
        }
    }
}
