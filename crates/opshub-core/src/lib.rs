//! Core types for the OpsHub integration hub.
//!
//! Everything that more than one layer needs lives here: adapter identities,
//! the event envelope, the conversational context model and its store trait,
//! call cancellation, configuration and process-local counters.

pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod types;

pub use call::{CallContext, Interruption};
pub use crate::config::{
    AdapterSettings, BridgeSettings, CircuitBreakerSettings, HubConfig, LoggingConfig,
    RateLimitSettings, RetrySettings, SafetySettings,
};
pub use context::{
    Context, ContextLogEntry, ContextRole, ContextStore, ContextStoreError, ContextUpdateOptions,
    estimate_tokens, ListOptions, TruncateStrategy,
};
pub use error::{CoreError, CoreResult};
pub use events::{event_types, AdapterEvent, META_CONTEXT_ID, META_CONTEXT_RECORDED};
pub use metrics::{Counter, HubMetrics, MetricsSnapshot};
pub use types::{AdapterType, HealthState};
