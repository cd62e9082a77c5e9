//! Adapter manager for the OpsHub integration hub
//!
//! [`AdapterManager`] is the single entry point for callers: it resolves
//! adapters through the registry, enforces the safety policy, records
//! outcomes into conversational contexts and routes inbound webhooks.

pub mod error;
pub mod manager;
pub mod telemetry;

pub use error::{ManagerError, ManagerResult};
pub use manager::{AdapterManager, AdapterManagerBuilder};
pub use telemetry::{init_tracing, TelemetryConfig};
