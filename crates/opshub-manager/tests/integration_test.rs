//! End-to-end tests for the adapter manager.

use async_trait::async_trait;
use opshub_adapters::{AdapterResult, ServiceRequest, ServiceResponse, Transport};
use opshub_context::InMemoryContextStore;
use opshub_core::{
    event_types, AdapterSettings, AdapterType, CallContext, Context, ContextRole, ContextStore,
    HealthState, HubConfig, RetrySettings,
};
use opshub_events::listener_fn;
use opshub_manager::{AdapterManager, ManagerError};
use opshub_resilience::CircuitState;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedTransport {
    script: Mutex<VecDeque<u16>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    fn new(statuses: &[u16]) -> Arc<Self> {
        Self::with_delay(statuses, Duration::ZERO)
    }

    fn with_delay(statuses: &[u16], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(statuses.iter().copied().collect()),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ServiceRequest) -> AdapterResult<ServiceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let status = self.script.lock().unwrap().pop_front().unwrap_or(200);
        Ok(ServiceResponse::new(
            status,
            json!({ "path": request.path, "message": format!("status {}", status) }),
        ))
    }
}

fn ci_settings() -> AdapterSettings {
    AdapterSettings::new("https://ci.example.com")
        .with_token("key")
        .with_option("account_id", "acct")
        .with_option("project_id", "payments")
        .with_retry(RetrySettings::new(3, 10))
}

fn ff_settings() -> AdapterSettings {
    AdapterSettings::new("https://ff.example.com")
        .with_token("key")
        .with_option("account_id", "acct")
}

async fn store_with_context(id: &str) -> Arc<InMemoryContextStore> {
    let store = Arc::new(InMemoryContextStore::new());
    store
        .create_context(&CallContext::new(), Context::new("agent-1", "gpt", 10_000).with_id(id))
        .await
        .unwrap();
    store
}

// ==================== Action Tests ====================

#[tokio::test(start_paused = true)]
async fn test_ci_pipeline_recovers_and_is_recorded() {
    // Probe, then 503, 503, 200.
    let transport = ScriptedTransport::new(&[200, 503, 503, 200]);
    let store = store_with_context("ctx-1").await;
    let manager = AdapterManager::builder(
        HubConfig::default()
            .with_adapter(AdapterType::CiPipeline, ci_settings())
            .with_required(AdapterType::CiPipeline),
    )
    .with_transport(AdapterType::CiPipeline, transport.clone())
    .with_context_store(store.clone())
    .build()
    .unwrap();
    let ctx = CallContext::new();
    manager.initialize(&ctx).await.unwrap();

    let result = manager
        .execute_action(
            &ctx,
            "ctx-1",
            AdapterType::CiPipeline,
            "trigger_pipeline",
            json!({"pipeline_id": "build"}),
        )
        .await
        .unwrap();

    assert_eq!(result["path"], "pipeline/api/pipeline/execute/build");
    assert_eq!(transport.calls(), 4);
    assert_eq!(manager.circuit_state(AdapterType::CiPipeline), Some(CircuitState::Closed));
    let stats = manager.circuit_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].failure_count, 0);
    assert_eq!(manager.metrics().retries, 2);

    // Shutdown drains the background recording.
    manager.shutdown(&CallContext::new()).await.unwrap();
    let context = store.get_context(&CallContext::new(), "ctx-1").await.unwrap();
    assert_eq!(context.content.len(), 1);
    assert_eq!(context.content[0].role, ContextRole::Tool);
    assert!(context.content[0].content.contains("Status: success"));
    assert_eq!(manager.metrics().context_records, 1);
}

#[tokio::test]
async fn test_restricted_feature_flag_action_makes_no_calls() {
    let transport = ScriptedTransport::new(&[]);
    let store = store_with_context("ctx-ff").await;
    let manager = AdapterManager::builder(
        HubConfig::default()
            .with_adapter(AdapterType::FeatureFlags, ff_settings())
            .with_required(AdapterType::FeatureFlags),
    )
    .with_transport(AdapterType::FeatureFlags, transport.clone())
    .with_context_store(store.clone())
    .build()
    .unwrap();
    let ctx = CallContext::new();
    manager.initialize(&ctx).await.unwrap();
    let after_probe = transport.calls();

    let err = manager
        .execute_action(
            &ctx,
            "ctx-ff",
            AdapterType::FeatureFlags,
            "delete_feature_flag",
            json!({"identifier": "beta"}),
        )
        .await
        .unwrap_err();

    assert!(err.is_denial());
    assert!(err.to_string().starts_with("restricted operation"));
    assert_eq!(transport.calls(), after_probe);
    assert_eq!(manager.pending_recordings(), 0);

    let guard = manager
        .execute_action(
            &ctx,
            "ctx-ff",
            AdapterType::FeatureFlags,
            "toggle_feature_flag",
            json!({"identifier": "beta", "environment": "Production"}),
        )
        .await
        .unwrap_err();
    assert_eq!(guard.error_code(), "PRODUCTION_GUARD");
    assert_eq!(transport.calls(), after_probe);

    manager.shutdown(&CallContext::new()).await.unwrap();
    assert!(store
        .get_context(&CallContext::new(), "ctx-ff")
        .await
        .unwrap()
        .content
        .is_empty());
}

#[tokio::test]
async fn test_failure_is_announced_and_recorded() {
    let transport = ScriptedTransport::new(&[200, 404]);
    let store = store_with_context("ctx-2").await;
    let manager = AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::CiPipeline, ci_settings()))
        .with_transport(AdapterType::CiPipeline, transport.clone())
        .with_context_store(store.clone())
        .build()
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.subscribe(
        event_types::OPERATION_FAILURE,
        listener_fn("failures", move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        }),
    );

    let err = manager
        .execute_action(
            &CallContext::new(),
            "ctx-2",
            AdapterType::CiPipeline,
            "stop_pipeline",
            json!({"execution_id": "gone"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert_eq!(transport.calls(), 2);

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload["errorCode"], "NOT_FOUND");
    assert_eq!(event.context_id(), Some("ctx-2"));
    assert!(event.is_context_recorded());

    manager.shutdown(&CallContext::new()).await.unwrap();
    let context = store.get_context(&CallContext::new(), "ctx-2").await.unwrap();
    // Recorded once by the manager; the bridge skips the announced copy.
    assert_eq!(context.content.len(), 1);
    assert!(context.content[0].content.contains("Status: failure"));
}

// ==================== Registry Tests ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_actions_share_one_adapter() {
    let transport = ScriptedTransport::with_delay(&[], Duration::from_millis(20));
    let manager = Arc::new(
        AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::CiPipeline, ci_settings()))
            .with_transport(AdapterType::CiPipeline, transport.clone())
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute_action(
                        &CallContext::new(),
                        "",
                        AdapterType::CiPipeline,
                        "trigger_pipeline",
                        json!({"pipeline_id": format!("p{}", n)}),
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    // One probe plus one call per action.
    assert_eq!(transport.calls(), 9);
    assert_eq!(manager.metrics().adapter_initializations, 1);
    assert_eq!(manager.health().len(), 1);
}

// ==================== Webhook Tests ====================

#[tokio::test]
async fn test_webhook_recorded_in_context() {
    let manager = AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::CiPipeline, ci_settings()))
        .with_transport(AdapterType::CiPipeline, ScriptedTransport::new(&[]))
        .build()
        .unwrap();
    let ctx = CallContext::new();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.subscribe(
        event_types::WEBHOOK_RECEIVED,
        listener_fn("webhooks", move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        }),
    );

    let payload = json!({"pipeline": "deploy", "status": "failed"});
    let context_id = manager
        .record_webhook_in_context(&ctx, "agent-7", AdapterType::CiPipeline, "pipeline_failed", &payload)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.context_id(), Some(context_id.as_str()));
    assert_eq!(event.payload, payload);

    let again = manager
        .record_webhook_in_context(&ctx, "agent-7", AdapterType::CiPipeline, "pipeline_succeeded", &json!({}))
        .await
        .unwrap();
    assert_eq!(again, context_id);
}

#[tokio::test]
async fn test_relay_webhook_reclassified_through_manager() {
    let manager = AdapterManager::builder(HubConfig::default().with_adapter(AdapterType::CiPipeline, ci_settings()))
        .with_transport(AdapterType::CiPipeline, ScriptedTransport::new(&[]))
        .build()
        .unwrap();

    let body = json!({"event_source": "relay", "event_type": "deploy.started", "timestamp": "2024-05-01T00:00:00Z"});
    let event = manager
        .handle_webhook(&CallContext::new(), AdapterType::CiPipeline, "custom", body.to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(event.event_type, "deploy.started");

    let err = manager
        .handle_webhook(&CallContext::new(), AdapterType::CiPipeline, "custom", b"not json")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "WEBHOOK_REJECTED");
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_shutdown_closes_adapters() {
    let manager = AdapterManager::builder(
        HubConfig::default()
            .with_adapter(AdapterType::CiPipeline, ci_settings())
            .with_adapter(AdapterType::FeatureFlags, ff_settings())
            .with_required(AdapterType::CiPipeline)
            .with_required(AdapterType::FeatureFlags),
    )
    .with_transport(AdapterType::CiPipeline, ScriptedTransport::new(&[]))
    .with_transport(AdapterType::FeatureFlags, ScriptedTransport::new(&[503]))
    .build()
    .unwrap();
    let ctx = CallContext::new();
    manager.initialize(&ctx).await.unwrap();

    let health = manager.health();
    assert_eq!(health[&AdapterType::CiPipeline], HealthState::Healthy);
    assert!(matches!(health[&AdapterType::FeatureFlags], HealthState::Degraded(_)));

    manager.shutdown(&CallContext::new()).await.unwrap();

    assert!(manager.health().values().all(|h| *h == HealthState::Closed));
    assert!(matches!(
        manager.initialize(&ctx).await,
        Err(ManagerError::ShutDown)
    ));
}
