//! Circuit breaker implementation
//!
//! Stops calling a service after repeated transient failures and probes it
//! again with a single trial call once the open timeout has elapsed.

use dashmap::DashMap;
use opshub_core::{AdapterType, CircuitBreakerSettings, HubMetrics};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected without reaching the service
    Open,
    /// One trial request is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of this circuit breaker (for logging)
    pub name: String,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful trials needed to close from half-open
    pub half_open_success_threshold: u32,
    /// How long the circuit stays open before allowing a trial
    pub open_timeout: Duration,
    /// Failures older than this stop counting toward the threshold
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings("default", &CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_settings(name: &str, settings: &CircuitBreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: settings.failure_threshold.max(1),
            half_open_success_threshold: settings.half_open_success_threshold.max(1),
            open_timeout: settings.open_timeout(),
            failure_window: settings.failure_window(),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold.max(1);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    trial_in_flight: bool,
    window_start: Instant,
    last_transition: Instant,
}

struct CircuitBreakerInner {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    metrics: Option<Arc<HubMetrics>>,
}

/// Thread-safe circuit breaker
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<CircuitBreakerInner>,
}

/// Rejection returned while the circuit is open or its trial slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a breaker that counts its state transitions.
    pub fn with_metrics(config: CircuitBreakerConfig, metrics: Arc<HubMetrics>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: CircuitBreakerConfig, metrics: Option<Arc<HubMetrics>>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(CircuitBreakerInner {
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    half_open_successes: 0,
                    trial_in_flight: false,
                    window_start: now,
                    last_transition: now,
                }),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Current state. An expired open timeout is reported as `Open` until
    /// the next call attempts the trial.
    pub fn state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.state.lock().failure_count
    }

    /// Whether [`try_acquire`](Self::try_acquire) would reject right now.
    /// Never takes the trial slot.
    pub fn is_rejecting(&self) -> bool {
        let guard = self.inner.state.lock();
        match guard.state {
            CircuitState::Closed => false,
            CircuitState::Open => guard.last_transition.elapsed() < self.inner.config.open_timeout,
            CircuitState::HalfOpen => guard.trial_in_flight,
        }
    }

    /// Ask to make a call.
    ///
    /// Closed always admits. Open admits nothing until `open_timeout` has
    /// passed, then moves to half-open and admits exactly one trial.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpen> {
        let mut guard = self.inner.state.lock();
        match guard.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                if guard.last_transition.elapsed() >= self.inner.config.open_timeout {
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    guard.trial_in_flight = true;
                    Ok(self.permit(true))
                } else {
                    debug!(circuit_breaker = %self.inner.config.name, "Request rejected, circuit is open");
                    Err(CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if guard.trial_in_flight {
                    debug!(circuit_breaker = %self.inner.config.name, "Request rejected, trial call in flight");
                    Err(CircuitOpen)
                } else {
                    guard.trial_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    fn permit(&self, trial: bool) -> CallPermit {
        CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut guard = self.inner.state.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = 0;
                guard.window_start = Instant::now();
            }
            CircuitState::HalfOpen if trial => {
                guard.trial_in_flight = false;
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.inner.config.half_open_success_threshold {
                    self.transition(&mut guard, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened; its outcome is stale.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut guard = self.inner.state.lock();
        match guard.state {
            CircuitState::Closed => {
                if guard.window_start.elapsed() >= self.inner.config.failure_window {
                    guard.failure_count = 0;
                    guard.window_start = Instant::now();
                }
                guard.failure_count += 1;
                if guard.failure_count >= self.inner.config.failure_threshold {
                    self.transition(&mut guard, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                guard.trial_in_flight = false;
                self.transition(&mut guard, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn on_release(&self, trial: bool) {
        if trial {
            let mut guard = self.inner.state.lock();
            if guard.state == CircuitState::HalfOpen {
                guard.trial_in_flight = false;
            }
        }
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        let from = guard.state;
        if from == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                circuit_breaker = %self.inner.config.name,
                from = %from,
                to = %to,
                failures = guard.failure_count,
                "Circuit breaker state transition"
            ),
            _ => info!(
                circuit_breaker = %self.inner.config.name,
                from = %from,
                to = %to,
                "Circuit breaker state transition"
            ),
        }

        guard.state = to;
        guard.last_transition = Instant::now();
        guard.half_open_successes = 0;
        if to == CircuitState::Closed {
            guard.failure_count = 0;
            guard.window_start = guard.last_transition;
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.circuit_transitions.inc();
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let guard = self.inner.state.lock();
        CircuitBreakerStats {
            name: self.inner.config.name.clone(),
            state: guard.state,
            failure_count: guard.failure_count,
            since_transition: guard.last_transition.elapsed(),
        }
    }

    /// Force the circuit open (manual intervention)
    pub fn force_open(&self) {
        let mut guard = self.inner.state.lock();
        guard.trial_in_flight = false;
        self.transition(&mut guard, CircuitState::Open);
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let mut guard = self.inner.state.lock();
        guard.trial_in_flight = false;
        self.transition(&mut guard, CircuitState::Closed);
        guard.failure_count = 0;
    }
}

/// Admission to make one call. Settle it with [`success`](Self::success),
/// [`failure`](Self::failure) or [`release`](Self::release); dropping it
/// unsettled behaves like `release`.
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Count a transient failure against the circuit.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Give the slot back without counting the outcome.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.trial);
        }
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(skip)]
    pub since_transition: Duration,
}

/// One breaker per adapter type, created on first use.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<AdapterType, CircuitBreaker>>,
    metrics: Option<Arc<HubMetrics>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<HubMetrics>) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            metrics: Some(metrics),
        }
    }

    pub fn get_or_create(
        &self,
        adapter_type: AdapterType,
        settings: &CircuitBreakerSettings,
    ) -> CircuitBreaker {
        self.breakers
            .entry(adapter_type)
            .or_insert_with(|| {
                let config = CircuitBreakerConfig::from_settings(adapter_type.as_str(), settings);
                match &self.metrics {
                    Some(metrics) => CircuitBreaker::with_metrics(config, metrics.clone()),
                    None => CircuitBreaker::new(config),
                }
            })
            .clone()
    }

    pub fn get(&self, adapter_type: AdapterType) -> Option<CircuitBreaker> {
        self.breakers.get(&adapter_type).map(|b| b.clone())
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
