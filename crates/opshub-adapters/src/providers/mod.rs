//! Service providers and the generic adapter that drives them
//!
//! A [`ServiceProvider`] knows one service's routes, auth scheme and webhook
//! shapes. [`ServiceAdapter`] supplies everything else: the safety check,
//! resilience, webhook normalization, health and lifecycle events.

pub mod artifact_repo;
pub mod ci_pipeline;
pub mod code_quality;
pub mod feature_flags;
pub mod github;
pub mod security_scan;

pub use artifact_repo::ArtifactRepoProvider;
pub use ci_pipeline::CiPipelineProvider;
pub use code_quality::CodeQualityProvider;
pub use feature_flags::FeatureFlagsProvider;
pub use github::GitHubProvider;
pub use security_scan::SecurityScanProvider;

use async_trait::async_trait;
use opshub_core::{
    event_types, AdapterEvent, AdapterSettings, AdapterType, CallContext, HealthState, HubMetrics,
};
use opshub_events::{EventBus, EventListener, SubscriptionId};
use opshub_resilience::Resilience;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::safety::SafetyPolicy;
use crate::traits::Adapter;
use crate::transport::{ServiceRequest, Transport};
use crate::webhook;

/// A webhook recognised by one of the provider's typed shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedWebhook {
    pub event_type: String,
    pub metadata: Vec<(String, String)>,
}

impl TypedWebhook {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Service-specific knowledge plugged into [`ServiceAdapter`].
pub trait ServiceProvider: Send + Sync + 'static {
    fn adapter_type(&self) -> AdapterType;

    fn requires_token(&self) -> bool {
        true
    }

    /// Header carrying the API token.
    fn auth_header(&self, token: &str) -> (String, String) {
        ("Authorization".to_string(), format!("Bearer {}", token))
    }

    /// Cheap request used once at initialization to check connectivity.
    fn probe(&self) -> ServiceRequest;

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest>;

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest>;

    /// Match the payload against the typed shape registered for `label`.
    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook>;

    fn validate_settings(&self, settings: &AdapterSettings) -> AdapterResult<()> {
        if settings.base_url.trim().is_empty() {
            return Err(AdapterError::Configuration(format!(
                "{}: base_url is required",
                self.adapter_type()
            )));
        }
        let has_token = settings
            .api_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if self.requires_token() && !has_token {
            return Err(AdapterError::Configuration(format!(
                "{}: api_token is required",
                self.adapter_type()
            )));
        }
        Ok(())
    }
}

pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> AdapterResult<&'a str> {
    optional_str(params, key)
        .ok_or_else(|| AdapterError::InvalidRequest(format!("missing {} parameter", key)))
}

pub(crate) fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Numeric identifiers arrive as either JSON numbers or strings.
pub(crate) fn required_id(params: &Value, key: &str) -> AdapterResult<String> {
    match params.get(key) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(AdapterError::InvalidRequest(format!("missing {} parameter", key))),
    }
}

pub(crate) fn unsupported_action(action: &str) -> AdapterError {
    AdapterError::UnsupportedOperation(format!("unsupported action: {}", action))
}

pub(crate) fn unsupported_query(operation: &str) -> AdapterError {
    AdapterError::UnsupportedOperation(format!("unsupported operation: {}", operation))
}

pub(crate) fn typed<T: DeserializeOwned>(payload: &Value) -> Option<T> {
    serde_json::from_value(payload.clone()).ok()
}

/// Adapter implementation shared by every provider.
pub struct ServiceAdapter<P: ServiceProvider> {
    provider: P,
    transport: Arc<dyn Transport>,
    resilience: Resilience,
    bus: Arc<EventBus>,
    policy: Arc<SafetyPolicy>,
    health: RwLock<HealthState>,
    request_timeout: Duration,
    metrics: Option<Arc<HubMetrics>>,
}

impl<P: ServiceProvider> ServiceAdapter<P> {
    pub fn new(
        provider: P,
        transport: Arc<dyn Transport>,
        resilience: Resilience,
        bus: Arc<EventBus>,
        policy: Arc<SafetyPolicy>,
    ) -> Self {
        Self {
            provider,
            transport,
            resilience,
            bus,
            policy,
            health: RwLock::new(HealthState::Initializing),
            request_timeout: Duration::from_secs(30),
            metrics: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn ensure_open(&self) -> AdapterResult<()> {
        if *self.health.read() == HealthState::Closed {
            return Err(AdapterError::Closed(self.provider.adapter_type()));
        }
        Ok(())
    }

    fn set_health(&self, next: HealthState) {
        let previous = std::mem::replace(&mut *self.health.write(), next.clone());
        if previous == next {
            return;
        }

        let adapter_type = self.provider.adapter_type();
        info!(adapter_type = %adapter_type, from = %previous, to = %next, "Adapter health changed");
        self.bus.emit(AdapterEvent::new(
            adapter_type,
            event_types::ADAPTER_HEALTH_CHANGED,
            json!({ "previous": previous.to_string(), "current": next.to_string() }),
        ));
    }

    async fn send_once(&self, request: ServiceRequest) -> AdapterResult<Value> {
        match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await {
            Ok(response) => response?.into_result(),
            Err(_) => Err(AdapterError::Timeout(format!(
                "no response within {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    async fn call(&self, ctx: &CallContext, request: ServiceRequest) -> AdapterResult<Value> {
        let adapter_type = self.provider.adapter_type();
        self.resilience
            .execute(ctx, || self.send_once(request.clone()))
            .await
            .map_err(|e| AdapterError::from_resilience(adapter_type, e))
    }
}

#[async_trait]
impl<P: ServiceProvider> Adapter for ServiceAdapter<P> {
    fn adapter_type(&self) -> AdapterType {
        self.provider.adapter_type()
    }

    async fn initialize(&self, ctx: &CallContext, settings: &AdapterSettings) -> AdapterResult<()> {
        self.provider.validate_settings(settings)?;

        let adapter_type = self.provider.adapter_type();
        match ctx.run(self.send_once(self.provider.probe())).await? {
            Ok(_) => self.set_health(HealthState::Healthy),
            Err(e) => {
                warn!(adapter_type = %adapter_type, error = %e, "Connectivity probe failed, serving degraded");
                self.set_health(HealthState::Degraded(e.to_string()));
            }
        }
        Ok(())
    }

    async fn get_data(&self, ctx: &CallContext, query: &Value) -> AdapterResult<Value> {
        self.ensure_open()?;
        let operation = optional_str(query, "operation")
            .ok_or_else(|| AdapterError::InvalidRequest("missing operation in query".to_string()))?;
        let request = self.provider.route_query(operation, query)?;
        self.call(ctx, request).await
    }

    async fn execute_action(
        &self,
        ctx: &CallContext,
        context_id: &str,
        action: &str,
        params: &Value,
    ) -> AdapterResult<Value> {
        self.ensure_open()?;
        let adapter_type = self.provider.adapter_type();

        if let Err(denial) = self.policy.check(adapter_type, action, params) {
            warn!(adapter_type = %adapter_type, action, reason = %denial, "Operation denied by safety policy");
            if let Some(metrics) = &self.metrics {
                metrics.safety_denials.inc();
            }
            return Err(denial.into());
        }

        let request = self.provider.route_action(action, params)?;
        debug!(adapter_type = %adapter_type, action, context_id, path = %request.path, "Executing action");
        self.call(ctx, request).await
    }

    async fn handle_webhook(
        &self,
        ctx: &CallContext,
        event_type: &str,
        payload: &[u8],
    ) -> AdapterResult<AdapterEvent> {
        self.ensure_open()?;
        if let Some(reason) = ctx.interruption() {
            return Err(reason.into());
        }

        let adapter_type = self.provider.adapter_type();
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::WebhookRejected(format!("invalid JSON payload: {}", e)))?;

        let mut event = if let Some(typed) = self.provider.parse_webhook(event_type, &body) {
            let mut event = AdapterEvent::new(adapter_type, typed.event_type, body);
            for (key, value) in typed.metadata {
                event = event.with_metadata(key, value);
            }
            event
        } else if webhook::is_generic_relay(&body) {
            let relayed = webhook::relay_event_type(&body);
            debug!(adapter_type = %adapter_type, label = event_type, relayed = %relayed, "Reclassified relayed webhook");
            AdapterEvent::new(adapter_type, relayed, body).with_metadata("relay", "true")
        } else {
            AdapterEvent::new(adapter_type, webhook::label_event_type(event_type), body)
        };
        if !event_type.is_empty() {
            event = event.with_metadata("webhook_label", event_type);
        }

        self.bus.emit(event.clone());
        Ok(event)
    }

    fn subscribe(&self, event_type: &str, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.bus.subscribe(event_type, listener)
    }

    fn is_safe_operation(&self, action: &str, params: &Value) -> AdapterResult<bool> {
        self.policy
            .is_safe_operation(self.provider.adapter_type(), action, params)
    }

    fn health(&self) -> HealthState {
        self.health.read().clone()
    }

    async fn close(&self) -> AdapterResult<()> {
        let previous = std::mem::replace(&mut *self.health.write(), HealthState::Closed);
        if previous == HealthState::Closed {
            return Ok(());
        }

        let adapter_type = self.provider.adapter_type();
        info!(adapter_type = %adapter_type, "Adapter closed");
        self.bus.emit(AdapterEvent::new(
            adapter_type,
            event_types::ADAPTER_CLOSED,
            json!({ "previous": previous.to_string() }),
        ));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::ServiceResponse;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted responses and records every request it sees.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<AdapterResult<ServiceResponse>>>,
        pub requests: Mutex<Vec<ServiceRequest>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<AdapterResult<ServiceResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<ServiceRequest> {
            self.requests.lock().last().cloned()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: ServiceRequest) -> AdapterResult<ServiceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ServiceResponse::ok(json!({}))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use crate::transport::ServiceResponse;
    use opshub_events::listener_fn;
    use opshub_resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter(transport: Arc<ScriptedTransport>, bus: Arc<EventBus>) -> ServiceAdapter<FeatureFlagsProvider> {
        let resilience = Resilience::new(
            "feature-flags",
            RateLimiter::new(100, 100, Duration::from_millis(10)),
            CircuitBreaker::new(CircuitBreakerConfig::new("feature-flags")),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        ServiceAdapter::new(
            FeatureFlagsProvider::new("acct"),
            transport,
            resilience,
            bus,
            Arc::new(SafetyPolicy::new()),
        )
    }

    fn settings() -> AdapterSettings {
        AdapterSettings::new("https://ff.example.com").with_token("t0ken")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_initialize_probes_once() {
        let transport = ScriptedTransport::new(vec![]);
        let a = adapter(transport.clone(), Arc::new(EventBus::new()));

        a.initialize(&CallContext::new(), &settings()).await.unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(a.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_failed_probe_degrades() {
        let transport = ScriptedTransport::new(vec![Ok(ServiceResponse::new(503, Value::Null))]);
        let bus = Arc::new(EventBus::new());
        let changes = Arc::new(AtomicUsize::new(0));
        let c = changes.clone();
        bus.subscribe(
            event_types::ADAPTER_HEALTH_CHANGED,
            listener_fn("health", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let a = adapter(transport, bus);

        a.initialize(&CallContext::new(), &settings()).await.unwrap();
        settle().await;

        assert!(matches!(a.health(), HealthState::Degraded(_)));
        assert!(a.health().to_string().starts_with("unhealthy"));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_token_is_configuration_error() {
        let transport = ScriptedTransport::new(vec![]);
        let a = adapter(transport.clone(), Arc::new(EventBus::new()));

        let err = a
            .initialize(&CallContext::new(), &AdapterSettings::new("https://ff.example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Configuration(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_denied_action_never_reaches_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let a = adapter(transport.clone(), Arc::new(EventBus::new()));

        let err = a
            .execute_action(&CallContext::new(), "ctx-1", "delete_feature_flag", &json!({"identifier": "beta"}))
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::RestrictedOperation(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_get_data_requires_operation() {
        let a = adapter(ScriptedTransport::new(vec![]), Arc::new(EventBus::new()));
        let err = a.get_data(&CallContext::new(), &json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_webhook_typed_relay_and_label() {
        let bus = Arc::new(EventBus::new());
        let a = adapter(ScriptedTransport::new(vec![]), bus);
        let ctx = CallContext::new();

        let relayed = a
            .handle_webhook(&ctx, "push", br#"{"event_source":"jenkins","timestamp":"now","event_type":"build.done"}"#)
            .await
            .unwrap();
        assert_eq!(relayed.event_type, "build.done");
        assert_eq!(relayed.metadata.get("relay").map(String::as_str), Some("true"));

        let labelled = a.handle_webhook(&ctx, "audit", br#"{"actor":"sam"}"#).await.unwrap();
        assert_eq!(labelled.event_type, "audit");

        let unlabelled = a.handle_webhook(&ctx, "", br#"{"actor":"sam"}"#).await.unwrap();
        assert_eq!(unlabelled.event_type, event_types::GENERIC_WEBHOOK);
    }

    #[tokio::test]
    async fn test_invalid_webhook_is_rejected_and_not_published() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.subscribe(
            event_types::ALL,
            listener_fn("all", move |_| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let a = adapter(ScriptedTransport::new(vec![]), bus);

        let err = a
            .handle_webhook(&CallContext::new(), "push", b"{not json")
            .await
            .unwrap_err();
        settle().await;

        assert!(matches!(err, AdapterError::WebhookRejected(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        bus.subscribe(
            event_types::ADAPTER_CLOSED,
            listener_fn("closed", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let a = adapter(ScriptedTransport::new(vec![]), bus);

        a.close().await.unwrap();
        a.close().await.unwrap();
        settle().await;

        assert_eq!(a.health(), HealthState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            a.execute_action(&CallContext::new(), "", "get_feature_flags", &json!({})).await,
            Err(AdapterError::Closed(AdapterType::FeatureFlags))
        ));
    }
}
