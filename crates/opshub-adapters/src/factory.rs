//! Adapter construction.

use opshub_core::{AdapterSettings, AdapterType, HubMetrics};
use opshub_events::EventBus;
use opshub_resilience::{CircuitBreakerRegistry, Resilience};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::AdapterResult;
use crate::providers::{
    ArtifactRepoProvider, CiPipelineProvider, CodeQualityProvider, FeatureFlagsProvider,
    GitHubProvider, SecurityScanProvider, ServiceAdapter, ServiceProvider,
};
use crate::safety::SafetyPolicy;
use crate::traits::Adapter;
use crate::transport::{HttpTransport, Transport};

/// Builds uninitialized adapters. The registry calls `initialize` afterwards.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, adapter_type: AdapterType, settings: &AdapterSettings) -> AdapterResult<Arc<dyn Adapter>>;
}

/// Factory for the compiled-in providers.
///
/// Adapters share the event bus, safety policy and breaker registry handed in
/// here. A transport registered with [`with_transport`](Self::with_transport)
/// replaces the HTTP transport for that type.
pub struct DefaultAdapterFactory {
    bus: Arc<EventBus>,
    policy: Arc<SafetyPolicy>,
    breakers: CircuitBreakerRegistry,
    metrics: Arc<HubMetrics>,
    transports: HashMap<AdapterType, Arc<dyn Transport>>,
}

impl DefaultAdapterFactory {
    pub fn new(
        bus: Arc<EventBus>,
        policy: Arc<SafetyPolicy>,
        breakers: CircuitBreakerRegistry,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            bus,
            policy,
            breakers,
            metrics,
            transports: HashMap::new(),
        }
    }

    pub fn with_transport(mut self, adapter_type: AdapterType, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(adapter_type, transport);
        self
    }

    fn transport_for<P: ServiceProvider>(
        &self,
        provider: &P,
        settings: &AdapterSettings,
    ) -> AdapterResult<Arc<dyn Transport>> {
        if let Some(transport) = self.transports.get(&provider.adapter_type()) {
            return Ok(transport.clone());
        }

        let mut http = HttpTransport::from_settings(settings)?;
        if let Some(token) = settings.api_token.as_deref().filter(|t| !t.is_empty()) {
            let (name, value) = provider.auth_header(token);
            http = http.with_header(name, value);
        }
        Ok(Arc::new(http))
    }

    fn build<P: ServiceProvider>(
        &self,
        provider: P,
        settings: &AdapterSettings,
    ) -> AdapterResult<Arc<dyn Adapter>> {
        let adapter_type = provider.adapter_type();
        let transport = self.transport_for(&provider, settings)?;
        let breaker = self
            .breakers
            .get_or_create(adapter_type, &settings.circuit_breaker);
        let resilience = Resilience::from_settings(adapter_type.as_str(), settings, breaker)
            .with_metrics(self.metrics.clone());

        debug!(adapter_type = %adapter_type, base_url = %settings.base_url, "Building adapter");

        Ok(Arc::new(
            ServiceAdapter::new(
                provider,
                transport,
                resilience,
                self.bus.clone(),
                self.policy.clone(),
            )
            .with_request_timeout(settings.request_timeout())
            .with_metrics(self.metrics.clone()),
        ))
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, adapter_type: AdapterType, settings: &AdapterSettings) -> AdapterResult<Arc<dyn Adapter>> {
        match adapter_type {
            AdapterType::GitHub => self.build(GitHubProvider::from_settings(settings), settings),
            AdapterType::CiPipeline => self.build(CiPipelineProvider::from_settings(settings), settings),
            AdapterType::CodeQuality => self.build(CodeQualityProvider::from_settings(settings), settings),
            AdapterType::ArtifactRepo => self.build(ArtifactRepoProvider::from_settings(settings), settings),
            AdapterType::SecurityScan => self.build(SecurityScanProvider::from_settings(settings), settings),
            AdapterType::FeatureFlags => self.build(FeatureFlagsProvider::from_settings(settings), settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedTransport;

    fn factory() -> DefaultAdapterFactory {
        DefaultAdapterFactory::new(
            Arc::new(EventBus::new()),
            Arc::new(SafetyPolicy::new()),
            CircuitBreakerRegistry::new(),
            Arc::new(HubMetrics::new()),
        )
    }

    #[test]
    fn test_creates_every_type() {
        let factory = factory();
        let settings = AdapterSettings::new("https://svc.example.com").with_token("t");

        for adapter_type in AdapterType::ALL {
            let adapter = factory.create(adapter_type, &settings).unwrap();
            assert_eq!(adapter.adapter_type(), adapter_type);
        }
    }

    #[test]
    fn test_adapters_share_breaker_per_type() {
        let breakers = CircuitBreakerRegistry::new();
        let factory = DefaultAdapterFactory::new(
            Arc::new(EventBus::new()),
            Arc::new(SafetyPolicy::new()),
            breakers.clone(),
            Arc::new(HubMetrics::new()),
        );
        let settings = AdapterSettings::new("https://svc.example.com").with_token("t");

        factory.create(AdapterType::GitHub, &settings).unwrap();
        factory.create(AdapterType::GitHub, &settings).unwrap();
        factory.create(AdapterType::CodeQuality, &settings).unwrap();

        assert_eq!(breakers.stats().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_transport_is_used() {
        let transport = ScriptedTransport::new(vec![]);
        let factory = factory().with_transport(AdapterType::GitHub, transport.clone());
        let settings = AdapterSettings::new("https://api.github.com").with_token("t");

        let adapter = factory.create(AdapterType::GitHub, &settings).unwrap();
        adapter
            .initialize(&opshub_core::CallContext::new(), &settings)
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.last_request().unwrap().path, "rate_limit");
    }
}
