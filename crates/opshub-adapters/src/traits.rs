use async_trait::async_trait;
use opshub_core::{AdapterEvent, AdapterSettings, AdapterType, CallContext, HealthState};
use opshub_events::{EventListener, SubscriptionId};
use serde_json::Value;
use std::sync::Arc;

use crate::error::AdapterResult;

/// Uniform contract over one external DevOps service.
///
/// One live instance exists per [`AdapterType`]; the registry owns it and
/// only closes it at shutdown. Implementations must be safe to call from
/// many tasks at once.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn adapter_type(&self) -> AdapterType;

    /// Validate settings and probe the service once. A failed probe leaves
    /// the adapter serving in degraded mode rather than failing.
    async fn initialize(&self, ctx: &CallContext, settings: &AdapterSettings) -> AdapterResult<()>;

    /// Read-only query. `query["operation"]` selects what to fetch.
    async fn get_data(&self, ctx: &CallContext, query: &Value) -> AdapterResult<Value>;

    /// Run a named action. Safety rules are checked before any network work.
    async fn execute_action(
        &self,
        ctx: &CallContext,
        context_id: &str,
        action: &str,
        params: &Value,
    ) -> AdapterResult<Value>;

    /// Parse, normalize and publish an inbound webhook. Returns the event
    /// that was published.
    async fn handle_webhook(
        &self,
        ctx: &CallContext,
        event_type: &str,
        payload: &[u8],
    ) -> AdapterResult<AdapterEvent>;

    fn subscribe(&self, event_type: &str, listener: Arc<dyn EventListener>) -> SubscriptionId;

    fn is_safe_operation(&self, action: &str, params: &Value) -> AdapterResult<bool>;

    fn health(&self) -> HealthState;

    async fn close(&self) -> AdapterResult<()>;
}
