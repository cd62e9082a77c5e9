//! Context bridge
//!
//! Turns adapter operations, events and webhook deliveries into entries of a
//! token-budgeted [`Context`]. Each record is a read-modify-write against the
//! [`ContextStore`]; when the read keeps failing the entry is written through
//! a single append-only update instead.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use opshub_core::{
    event_types, AdapterEvent, AdapterType, BridgeSettings, CallContext, Context, ContextLogEntry,
    ContextRole, ContextStore, ContextStoreError, ContextUpdateOptions, HubMetrics, Interruption,
    ListOptions, TruncateStrategy, META_CONTEXT_RECORDED,
};
use opshub_events::{EventBus, EventError, EventListener, EventResult, SubscriptionId};
use opshub_resilience::{ResilienceError, RetryPolicy};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Model id stamped on contexts created for webhook deliveries.
pub const WEBHOOK_MODEL_ID: &str = "webhook";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Context store error: {0}")]
    Store(#[from] ContextStoreError),

    #[error("Context store still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ContextStoreError },

    #[error("Recording interrupted: {0}")]
    Interrupted(Interruption),

    #[error("Webhook not recorded in context {context_id}: {source}")]
    WebhookUnrecorded {
        context_id: String,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Store(e) => e.is_retryable(),
            BridgeError::Exhausted { .. } => true,
            BridgeError::Interrupted(_) => false,
            BridgeError::WebhookUnrecorded { source, .. } => source.is_retryable(),
        }
    }

    /// The context a webhook was meant for, when it was resolved before
    /// the write failed.
    pub fn context_id(&self) -> Option<&str> {
        match self {
            BridgeError::WebhookUnrecorded { context_id, .. } => Some(context_id),
            _ => None,
        }
    }
}

impl From<ResilienceError<ContextStoreError>> for BridgeError {
    fn from(err: ResilienceError<ContextStoreError>) -> Self {
        match err {
            ResilienceError::Interrupted(reason) => BridgeError::Interrupted(reason),
            ResilienceError::Exhausted { attempts, last } => BridgeError::Exhausted { attempts, last },
            ResilienceError::Failed(e) => BridgeError::Store(e),
            ResilienceError::CircuitOpen => {
                BridgeError::Store(ContextStoreError::Unavailable("circuit open".to_string()))
            }
            ResilienceError::RateLimited => {
                BridgeError::Store(ContextStoreError::Unavailable("rate limited".to_string()))
            }
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Serialize `value` for both the entry text and its metadata. A value that
/// cannot be serialized becomes `placeholder` in both places.
fn to_json<T: Serialize + ?Sized>(value: &T, placeholder: &str) -> (String, Value) {
    match serde_json::to_value(value) {
        Ok(json) => (json.to_string(), json),
        Err(e) => {
            warn!(error = %e, placeholder, "Serialization failed, recording placeholder");
            (placeholder.to_string(), Value::String(placeholder.to_string()))
        }
    }
}

pub struct ContextBridge {
    store: Arc<dyn ContextStore>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    webhook_max_tokens: usize,
    record_timeout: Duration,
    metrics: Option<Arc<HubMetrics>>,
}

impl ContextBridge {
    pub fn new(store: Arc<dyn ContextStore>, bus: Arc<EventBus>, settings: &BridgeSettings) -> Self {
        Self {
            store,
            bus,
            retry: RetryPolicy::from_settings(&settings.retry),
            webhook_max_tokens: settings.webhook_max_tokens,
            record_timeout: settings.record_timeout(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribe this bridge to every event on the bus so that events
    /// carrying a context id are recorded.
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        self.bus.subscribe(event_types::ALL, self.clone())
    }

    /// Record one adapter operation as a `tool` entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_operation<Req, Resp>(
        &self,
        ctx: &CallContext,
        context_id: &str,
        adapter_type: AdapterType,
        operation: &str,
        request: &Req,
        response: Option<&Resp>,
        error: Option<&str>,
    ) -> BridgeResult<()>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: Serialize + ?Sized + Sync,
    {
        let (request_text, request_json) = to_json(request, "Error marshaling request");
        let (response_text, response_json) = match response {
            Some(response) => to_json(response, "Error marshaling response"),
            None => (String::new(), Value::Null),
        };
        let status = if error.is_some() { "failure" } else { "success" };

        let mut content = format!(
            "Operation: {}\nAdapter: {}\nStatus: {}\nRequest: {}",
            operation, adapter_type, status, request_text
        );
        if response.is_some() {
            content.push_str("\nResponse: ");
            content.push_str(&response_text);
        }
        if let Some(error) = error {
            content.push_str("\nError: ");
            content.push_str(error);
        }

        let mut entry = ContextLogEntry::new(ContextRole::Tool, content)
            .with_metadata("adapter", adapter_type.as_str())
            .with_metadata("operation", operation)
            .with_metadata("status", status)
            .with_metadata("request", request_json)
            .with_metadata("response", response_json);
        if let Some(error) = error {
            entry = entry.with_metadata("error", error);
        }

        self.write_entry(ctx, context_id, entry).await
    }

    /// Record an adapter event as an `event` entry stamped with the event's
    /// own timestamp.
    pub async fn record_event(
        &self,
        ctx: &CallContext,
        context_id: &str,
        event: &AdapterEvent,
    ) -> BridgeResult<()> {
        let (payload_text, payload_json) = to_json(&event.payload, "Error marshaling payload");
        let (_, event_meta) = to_json(&event.metadata, "Error marshaling metadata");

        let content = format!(
            "Event: {}\nAdapter: {}\nTimestamp: {}\nPayload: {}",
            event.event_type,
            event.adapter_type,
            event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            payload_text
        );
        let entry = ContextLogEntry::new(ContextRole::Event, content)
            .with_timestamp(event.timestamp)
            .with_metadata("adapter", event.adapter_type.as_str())
            .with_metadata("eventType", event.event_type.as_str())
            .with_metadata("eventId", event.id.to_string())
            .with_metadata("payload", payload_json)
            .with_metadata("eventMeta", event_meta);

        self.write_entry(ctx, context_id, entry).await
    }

    /// Record a webhook delivery into the agent's latest context, creating
    /// one when the agent has none, and announce it with
    /// `webhook.received`. Returns the context id; a failed write reports it
    /// through [`BridgeError::context_id`].
    pub async fn record_webhook<P>(
        &self,
        ctx: &CallContext,
        agent_id: &str,
        adapter_type: AdapterType,
        event_type: &str,
        payload: &P,
    ) -> BridgeResult<String>
    where
        P: Serialize + ?Sized + Sync,
    {
        let (payload_text, payload_json) = to_json(payload, "Error marshaling payload");

        let latest_only = ListOptions::latest();
        let latest = self
            .retry
            .retry(ctx, || self.store.list_contexts(ctx, agent_id, &latest_only))
            .await?;
        let mut context = match latest.into_iter().next() {
            Some(context) => context,
            None => {
                let fresh = Context::new(agent_id, WEBHOOK_MODEL_ID, self.webhook_max_tokens)
                    .with_metadata("source", "webhook");
                let created = self
                    .retry
                    .retry(ctx, || self.store.create_context(ctx, fresh.clone()))
                    .await?;
                info!(agent_id, context_id = %created.id, "Created context for webhook deliveries");
                created
            }
        };
        let context_id = context.id.clone();

        let received_at = Utc::now();
        let content = format!(
            "Webhook: {}\nAdapter: {}\nTimestamp: {}\nPayload: {}",
            event_type,
            adapter_type,
            received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            payload_text
        );
        context.append(
            ContextLogEntry::new(ContextRole::Webhook, content)
                .with_timestamp(received_at)
                .with_metadata("adapter", adapter_type.as_str())
                .with_metadata("eventType", event_type)
                .with_metadata("payload", payload_json.clone()),
        );
        context.truncate(TruncateStrategy::OldestFirst);

        let options = ContextUpdateOptions::replace_truncating();
        self.retry
            .retry(ctx, || self.store.update_context(ctx, &context_id, &context, &options))
            .await
            .map_err(|e| {
                self.record_failure();
                warn!(agent_id, context_id = %context_id, error = %e, "Webhook not recorded");
                BridgeError::WebhookUnrecorded {
                    context_id: context_id.clone(),
                    source: Box::new(BridgeError::from(e)),
                }
            })?;
        self.record_success();

        self.bus.emit(
            AdapterEvent::new(adapter_type, event_types::WEBHOOK_RECEIVED, payload_json)
                .with_context_id(context_id.as_str())
                .with_metadata("eventType", event_type)
                .with_metadata(META_CONTEXT_RECORDED, "true"),
        );

        Ok(context_id)
    }

    async fn write_entry(
        &self,
        ctx: &CallContext,
        context_id: &str,
        entry: ContextLogEntry,
    ) -> BridgeResult<()> {
        let read = self
            .retry
            .retry(ctx, || self.store.get_context(ctx, context_id))
            .await;

        let mut context = match read {
            Ok(context) => context,
            Err(ResilienceError::Interrupted(reason)) => {
                self.record_failure();
                return Err(BridgeError::Interrupted(reason));
            }
            Err(e) => {
                warn!(context_id, error = %e, "Context read failed, appending entry standalone");
                return self.append_standalone(ctx, context_id, entry).await;
            }
        };

        context.append(entry);
        let dropped = context.truncate(TruncateStrategy::OldestFirst);
        if dropped > 0 {
            debug!(context_id, dropped, tokens = context.current_tokens, "Context truncated");
        }

        let options = ContextUpdateOptions::replace_truncating();
        self.retry
            .retry(ctx, || self.store.update_context(ctx, context_id, &context, &options))
            .await
            .map_err(|e| {
                self.record_failure();
                BridgeError::from(e)
            })?;

        self.record_success();
        Ok(())
    }

    /// One best-effort append of `entry` without knowing the stored log.
    async fn append_standalone(
        &self,
        ctx: &CallContext,
        context_id: &str,
        entry: ContextLogEntry,
    ) -> BridgeResult<()> {
        if let Some(metrics) = &self.metrics {
            metrics.context_degraded_writes.inc();
        }

        let mut shell = Context::new("", "", 0).with_id(context_id);
        shell.append(entry);

        match self
            .store
            .update_context(ctx, context_id, &shell, &ContextUpdateOptions::append_truncating())
            .await
        {
            Ok(_) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e.into())
            }
        }
    }

    fn record_success(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.context_records.inc();
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.context_record_failures.inc();
        }
    }
}

#[async_trait]
impl EventListener for ContextBridge {
    async fn on_event(&self, event: Arc<AdapterEvent>) -> EventResult<()> {
        let Some(context_id) = event.context_id() else {
            return Ok(());
        };
        if event.is_context_recorded() {
            return Ok(());
        }

        let ctx = CallContext::detached(self.record_timeout);
        self.record_event(&ctx, context_id, &event)
            .await
            .map_err(|e| EventError::Listener(e.to_string()))
    }

    fn name(&self) -> &str {
        "context-bridge"
    }
}
