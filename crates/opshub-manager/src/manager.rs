//! Adapter manager
//!
//! Single entry point for the hub. Owns the registry, event bus, safety
//! policy, breaker registry and context bridge; nothing is global.

use opshub_adapters::{
    Adapter, AdapterError, AdapterFactory, AdapterRegistry, DefaultAdapterFactory, SafetyPolicy,
    Transport, WebhookVerifier,
};
use opshub_context::{ContextBridge, InMemoryContextStore};
use opshub_core::{
    event_types, AdapterEvent, AdapterType, CallContext, ContextStore, HealthState, HubConfig,
    HubMetrics, MetricsSnapshot, META_CONTEXT_RECORDED,
};
use opshub_events::{EventBus, EventListener, SubscriptionId};
use opshub_resilience::{CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};

/// Builder for [`AdapterManager`].
pub struct AdapterManagerBuilder {
    config: HubConfig,
    store: Option<Arc<dyn ContextStore>>,
    factory: Option<Arc<dyn AdapterFactory>>,
    transports: HashMap<AdapterType, Arc<dyn Transport>>,
    metrics: Option<Arc<HubMetrics>>,
}

impl AdapterManagerBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            store: None,
            factory: None,
            transports: HashMap::new(),
            metrics: None,
        }
    }

    /// Store the bridge records into. Defaults to an [`InMemoryContextStore`].
    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default factory. Transports registered with
    /// [`with_transport`](Self::with_transport) are then ignored, and
    /// [`AdapterManager::circuit_state`] only reports breakers the custom
    /// factory did not bypass.
    pub fn with_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_transport(mut self, adapter_type: AdapterType, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(adapter_type, transport);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ManagerResult<AdapterManager> {
        self.config.validate()?;

        let metrics = self.metrics.unwrap_or_default();
        let bus = Arc::new(EventBus::new().with_metrics(metrics.clone()));
        let breakers = CircuitBreakerRegistry::with_metrics(metrics.clone());
        let policy = Arc::new(SafetyPolicy::from_config(&self.config));

        let factory: Arc<dyn AdapterFactory> = match self.factory {
            Some(factory) => factory,
            None => {
                let mut factory = DefaultAdapterFactory::new(
                    bus.clone(),
                    policy.clone(),
                    breakers.clone(),
                    metrics.clone(),
                );
                for (adapter_type, transport) in self.transports {
                    factory = factory.with_transport(adapter_type, transport);
                }
                Arc::new(factory)
            }
        };

        let store: Arc<dyn ContextStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryContextStore::new()),
        };
        let bridge = Arc::new(
            ContextBridge::new(store, bus.clone(), &self.config.context).with_metrics(metrics.clone()),
        );
        let bridge_subscription = bridge.attach();

        Ok(AdapterManager {
            registry: AdapterRegistry::new(factory, &self.config).with_metrics(metrics.clone()),
            bus,
            policy,
            bridge,
            breakers,
            metrics,
            bridge_subscription,
            recordings: TaskTracker::new(),
            record_timeout: self.config.context.record_timeout(),
            required: self.config.required_adapters,
            shut_down: AtomicBool::new(false),
        })
    }
}

pub struct AdapterManager {
    registry: AdapterRegistry,
    bus: Arc<EventBus>,
    policy: Arc<SafetyPolicy>,
    bridge: Arc<ContextBridge>,
    breakers: CircuitBreakerRegistry,
    metrics: Arc<HubMetrics>,
    bridge_subscription: SubscriptionId,
    recordings: TaskTracker,
    record_timeout: Duration,
    required: Vec<AdapterType>,
    shut_down: AtomicBool,
}

impl AdapterManager {
    pub fn builder(config: HubConfig) -> AdapterManagerBuilder {
        AdapterManagerBuilder::new(config)
    }

    fn ensure_running(&self) -> ManagerResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ManagerError::ShutDown);
        }
        Ok(())
    }

    /// Resolve every required adapter, failing on the first that cannot be
    /// created or initialized.
    pub async fn initialize(&self, ctx: &CallContext) -> ManagerResult<()> {
        self.ensure_running()?;

        for &adapter_type in &self.required {
            self.registry
                .get_adapter(ctx, adapter_type)
                .await
                .map_err(|source| ManagerError::Initialization {
                    adapter_type,
                    source,
                })?;
        }

        info!(required = self.required.len(), "Adapter manager initialized");
        Ok(())
    }

    pub async fn adapter(
        &self,
        ctx: &CallContext,
        adapter_type: AdapterType,
    ) -> ManagerResult<Arc<dyn Adapter>> {
        self.ensure_running()?;
        Ok(self.registry.get_adapter(ctx, adapter_type).await?)
    }

    /// Run `action` on the adapter for `adapter_type`.
    ///
    /// The outcome is recorded into `context_id` in the background; a
    /// recording failure is logged and never reaches the caller. An empty
    /// `context_id` skips recording.
    pub async fn execute_action(
        &self,
        ctx: &CallContext,
        context_id: &str,
        adapter_type: AdapterType,
        action: &str,
        params: Value,
    ) -> ManagerResult<Value> {
        let adapter = self.adapter(ctx, adapter_type).await?;

        if let Err(denial) = adapter.is_safe_operation(action, &params) {
            warn!(adapter_type = %adapter_type, action, error = %denial, "Action denied by safety policy");
            self.metrics.safety_denials.inc();
            return Err(denial.into());
        }

        let outcome = adapter.execute_action(ctx, context_id, action, &params).await;
        self.announce_outcome(context_id, adapter_type, action, &params, &outcome);
        self.spawn_recording(context_id, adapter_type, action, params, &outcome);

        Ok(outcome?)
    }

    fn announce_outcome(
        &self,
        context_id: &str,
        adapter_type: AdapterType,
        action: &str,
        params: &Value,
        outcome: &Result<Value, AdapterError>,
    ) {
        let (event_type, payload) = match outcome {
            Ok(result) => (
                event_types::OPERATION_SUCCESS,
                json!({ "action": action, "params": params, "result": result }),
            ),
            Err(e) => (
                event_types::OPERATION_FAILURE,
                json!({
                    "action": action,
                    "params": params,
                    "error": e.to_string(),
                    "errorCode": e.error_code(),
                }),
            ),
        };

        let mut event = AdapterEvent::new(adapter_type, event_type, payload).with_metadata("action", action);
        if !context_id.is_empty() {
            event = event
                .with_context_id(context_id)
                .with_metadata(META_CONTEXT_RECORDED, "true");
        }
        self.bus.emit(event);
    }

    fn spawn_recording(
        &self,
        context_id: &str,
        adapter_type: AdapterType,
        action: &str,
        params: Value,
        outcome: &Result<Value, AdapterError>,
    ) {
        if context_id.is_empty() {
            return;
        }

        let bridge = self.bridge.clone();
        let ctx = CallContext::detached(self.record_timeout);
        let context_id = context_id.to_string();
        let action = action.to_string();
        let response = outcome.as_ref().ok().cloned();
        let error = outcome.as_ref().err().map(|e| e.to_string());

        self.recordings.spawn(async move {
            let recorded = bridge
                .record_operation(
                    &ctx,
                    &context_id,
                    adapter_type,
                    &action,
                    &params,
                    response.as_ref(),
                    error.as_deref(),
                )
                .await;
            match recorded {
                Ok(()) => debug!(context_id, action, "Operation recorded"),
                Err(e) => warn!(
                    context_id,
                    adapter_type = %adapter_type,
                    action,
                    error = %e,
                    "Failed to record operation in context"
                ),
            }
        });
    }

    /// Read-only query. No safety check applies.
    pub async fn get_data(
        &self,
        ctx: &CallContext,
        adapter_type: AdapterType,
        query: &Value,
    ) -> ManagerResult<Value> {
        let adapter = self.adapter(ctx, adapter_type).await?;
        Ok(adapter.get_data(ctx, query).await?)
    }

    /// Hand an inbound webhook body to its adapter, which normalizes and
    /// publishes it. Returns the published event.
    pub async fn handle_webhook(
        &self,
        ctx: &CallContext,
        adapter_type: AdapterType,
        event_type: &str,
        payload: &[u8],
    ) -> ManagerResult<AdapterEvent> {
        let adapter = self.adapter(ctx, adapter_type).await?;
        Ok(adapter.handle_webhook(ctx, event_type, payload).await?)
    }

    /// [`handle_webhook`](Self::handle_webhook) after checking `signature`
    /// against the adapter's webhook secret.
    pub async fn handle_signed_webhook(
        &self,
        ctx: &CallContext,
        adapter_type: AdapterType,
        event_type: &str,
        payload: &[u8],
        signature: &str,
    ) -> ManagerResult<AdapterEvent> {
        self.ensure_running()?;

        let secret = self
            .registry
            .settings(adapter_type)
            .and_then(|s| s.webhook_secret.as_deref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AdapterError::WebhookRejected(format!("no webhook secret configured for {}", adapter_type))
            })?;

        if let Err(e) = WebhookVerifier::new(secret).verify(payload, signature) {
            warn!(adapter_type = %adapter_type, event_type, "Webhook signature rejected");
            return Err(e.into());
        }

        self.handle_webhook(ctx, adapter_type, event_type, payload).await
    }

    /// Record a webhook delivery into the agent's latest context and return
    /// the context id.
    pub async fn record_webhook_in_context(
        &self,
        ctx: &CallContext,
        agent_id: &str,
        adapter_type: AdapterType,
        event_type: &str,
        payload: &Value,
    ) -> ManagerResult<String> {
        self.ensure_running()?;
        Ok(self
            .bridge
            .record_webhook(ctx, agent_id, adapter_type, event_type, payload)
            .await?)
    }

    pub fn subscribe(&self, event_type: &str, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.bus.subscribe(event_type, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Safety check without running anything.
    pub fn is_safe_operation(&self, adapter_type: AdapterType, action: &str, params: &Value) -> ManagerResult<bool> {
        Ok(self.policy.is_safe_operation(adapter_type, action, params)?)
    }

    /// Health of every adapter created so far.
    pub fn health(&self) -> BTreeMap<AdapterType, HealthState> {
        self.registry
            .list_adapters()
            .into_iter()
            .map(|(adapter_type, adapter)| (adapter_type, adapter.health()))
            .collect()
    }

    pub fn circuit_state(&self, adapter_type: AdapterType) -> Option<CircuitState> {
        self.breakers.get(adapter_type).map(|b| b.state())
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Recordings spawned by `execute_action` that have not finished yet.
    pub fn pending_recordings(&self) -> usize {
        self.recordings.len()
    }

    /// Close every live adapter and wait for in-flight recordings, bounded
    /// by the record timeout. Close failures are logged. Later calls are
    /// no-ops.
    /// Stop accepting calls, close every adapter and wait for in-flight
    /// context recordings. The wait is bounded by the record timeout and by
    /// `ctx`; only an interrupted `ctx` is an error. Repeated calls return
    /// `Ok` at once.
    pub async fn shutdown(&self, ctx: &CallContext) -> ManagerResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.bus.unsubscribe(self.bridge_subscription);

        for (adapter_type, adapter) in self.registry.list_adapters() {
            if let Err(e) = adapter.close().await {
                warn!(adapter_type = %adapter_type, error = %e, "Failed to close adapter");
            }
        }

        self.recordings.close();
        let drain = ctx.child().with_timeout(self.record_timeout);
        if self.recordings.is_empty() {
            debug!("No context recordings in flight");
        } else if let Err(reason) = drain.run(self.recordings.wait()).await {
            warn!(
                pending = self.recordings.len(),
                reason = %reason,
                "Context recordings still running at shutdown"
            );
            if let Some(reason) = ctx.interruption() {
                return Err(ManagerError::Interrupted(reason));
            }
        }

        info!("Adapter manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opshub_adapters::{AdapterResult, ServiceRequest, ServiceResponse};
    use opshub_core::{
        AdapterSettings, Context, ContextStoreError, ContextUpdateOptions, Interruption, ListOptions,
    };

    struct OkTransport;

    #[async_trait::async_trait]
    impl Transport for OkTransport {
        async fn send(&self, request: ServiceRequest) -> AdapterResult<ServiceResponse> {
            Ok(ServiceResponse::ok(json!({ "path": request.path })))
        }
    }

    /// Store whose every call outlasts any reasonable deadline.
    struct StalledStore;

    impl StalledStore {
        async fn stall<T>() -> Result<T, ContextStoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ContextStoreError::Unavailable("stalled".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl ContextStore for StalledStore {
        async fn get_context(&self, _ctx: &CallContext, _id: &str) -> Result<Context, ContextStoreError> {
            Self::stall().await
        }

        async fn create_context(&self, _ctx: &CallContext, _context: Context) -> Result<Context, ContextStoreError> {
            Self::stall().await
        }

        async fn update_context(
            &self,
            _ctx: &CallContext,
            _id: &str,
            _context: &Context,
            _options: &ContextUpdateOptions,
        ) -> Result<Context, ContextStoreError> {
            Self::stall().await
        }

        async fn list_contexts(
            &self,
            _ctx: &CallContext,
            _agent_id: &str,
            _options: &ListOptions,
        ) -> Result<Vec<Context>, ContextStoreError> {
            Self::stall().await
        }
    }

    fn manager(config: HubConfig) -> AdapterManager {
        AdapterManager::builder(config)
            .with_transport(AdapterType::GitHub, Arc::new(OkTransport))
            .build()
            .unwrap()
    }

    fn github() -> AdapterSettings {
        AdapterSettings::new("https://api.github.com")
            .with_token("t")
            .with_webhook_secret("whsec")
            .with_option("owner", "acme")
    }

    #[test]
    fn test_build_rejects_required_without_settings() {
        let config = HubConfig::default().with_required(AdapterType::SecurityScan);

        let err = AdapterManager::builder(config).build().err().unwrap();
        assert!(matches!(err, ManagerError::Config(_)));
    }

    #[tokio::test]
    async fn test_initialize_resolves_required() {
        let config = HubConfig::default()
            .with_adapter(AdapterType::GitHub, github())
            .with_required(AdapterType::GitHub);
        let manager = manager(config);

        manager.initialize(&CallContext::new()).await.unwrap();

        let health = manager.health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[&AdapterType::GitHub], HealthState::Healthy);
        assert_eq!(manager.circuit_state(AdapterType::GitHub), Some(CircuitState::Closed));
        assert_eq!(manager.metrics().adapter_initializations, 1);
    }

    #[tokio::test]
    async fn test_initialize_reports_failing_type() {
        let config = HubConfig::default()
            .with_adapter(AdapterType::GitHub, AdapterSettings::new(""))
            .with_required(AdapterType::GitHub);
        let manager = manager(config);

        let err = manager.initialize(&CallContext::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Initialization { adapter_type: AdapterType::GitHub, .. }
        ));
        assert!(manager.health().is_empty());
    }

    #[tokio::test]
    async fn test_force_merge_denied_before_adapter_call() {
        let manager = manager(HubConfig::default().with_adapter(AdapterType::GitHub, github()));
        let ctx = CallContext::new();

        let err = manager
            .execute_action(
                &ctx,
                "",
                AdapterType::GitHub,
                "merge_pull_request",
                json!({"repo": "api", "number": 7, "force": true}),
            )
            .await
            .unwrap_err();

        assert!(err.is_denial());
        assert_eq!(manager.metrics().safety_denials, 1);
        assert!(manager
            .is_safe_operation(AdapterType::GitHub, "merge_pull_request", &json!({"number": 7}))
            .unwrap());
    }

    #[tokio::test]
    async fn test_signed_webhook_requires_secret_and_signature() {
        let settings = AdapterSettings::new("https://api.github.com").with_token("t");
        let manager = AdapterManager::builder(
            HubConfig::default()
                .with_adapter(AdapterType::GitHub, github())
                .with_adapter(AdapterType::CodeQuality, settings),
        )
        .with_transport(AdapterType::GitHub, Arc::new(OkTransport))
        .with_transport(AdapterType::CodeQuality, Arc::new(OkTransport))
        .build()
        .unwrap();
        let ctx = CallContext::new();
        let body = br#"{"zen":"Practicality beats purity."}"#;

        let unsigned = manager
            .handle_signed_webhook(&ctx, AdapterType::CodeQuality, "ping", body, "sha256=00")
            .await
            .unwrap_err();
        assert_eq!(unsigned.error_code(), "WEBHOOK_REJECTED");

        let forged = manager
            .handle_signed_webhook(&ctx, AdapterType::GitHub, "ping", body, "sha256=00")
            .await
            .unwrap_err();
        assert_eq!(forged.error_code(), "WEBHOOK_REJECTED");
        assert!(manager.health().is_empty());

        let signature = WebhookVerifier::new("whsec").sign(body).unwrap();
        let event = manager
            .handle_signed_webhook(&ctx, AdapterType::GitHub, "ping", body, &signature)
            .await
            .unwrap();
        assert_eq!(event.event_type, "ping");
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let manager = manager(HubConfig::default().with_adapter(AdapterType::GitHub, github()));
        let ctx = CallContext::new();
        let adapter = manager.adapter(&ctx, AdapterType::GitHub).await.unwrap();

        manager.shutdown(&ctx).await.unwrap();
        manager.shutdown(&ctx).await.unwrap();

        assert_eq!(adapter.health(), HealthState::Closed);
        assert!(matches!(
            manager.get_data(&ctx, AdapterType::GitHub, &json!({"operation": "get_repository"})).await,
            Err(ManagerError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drain_bounded_by_caller() {
        let manager = AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::GitHub, github()))
            .with_transport(AdapterType::GitHub, Arc::new(OkTransport))
            .with_context_store(Arc::new(StalledStore))
            .build()
            .unwrap();

        manager
            .execute_action(
                &CallContext::new(),
                "ctx-1",
                AdapterType::GitHub,
                "create_issue",
                json!({"repo": "api", "title": "flaky build"}),
            )
            .await
            .unwrap();
        assert_eq!(manager.pending_recordings(), 1);

        let start = tokio::time::Instant::now();
        let err = manager
            .shutdown(&CallContext::new().with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Interrupted(Interruption::DeadlineExceeded)));
        assert_eq!(err.error_code(), "INTERRUPTED");
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < manager.record_timeout);
        assert!(manager.shutdown(&CallContext::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drain_gives_up_after_record_timeout() {
        let manager = AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::GitHub, github()))
            .with_transport(AdapterType::GitHub, Arc::new(OkTransport))
            .with_context_store(Arc::new(StalledStore))
            .build()
            .unwrap();

        manager
            .execute_action(
                &CallContext::new(),
                "ctx-1",
                AdapterType::GitHub,
                "create_issue",
                json!({"repo": "api", "title": "flaky build"}),
            )
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        manager.shutdown(&CallContext::new()).await.unwrap();
        assert!(start.elapsed() <= manager.record_timeout);
    }
}
