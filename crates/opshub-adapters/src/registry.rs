//! Adapter registry
//!
//! Creates adapters on first use and caches them for the life of the process.
//! Construction of one type is serialized behind a per-type async lock so
//! concurrent first callers share a single instance and a single probe.
//! Failures are not cached; the next caller tries again.

use opshub_core::{AdapterSettings, AdapterType, CallContext, HubConfig, HubMetrics};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::factory::AdapterFactory;
use crate::traits::Adapter;

pub struct AdapterRegistry {
    factory: Arc<dyn AdapterFactory>,
    settings: HashMap<AdapterType, AdapterSettings>,
    adapters: RwLock<HashMap<AdapterType, Arc<dyn Adapter>>>,
    init_locks: Mutex<HashMap<AdapterType, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Option<Arc<HubMetrics>>,
}

impl AdapterRegistry {
    pub fn new(factory: Arc<dyn AdapterFactory>, config: &HubConfig) -> Self {
        Self {
            factory,
            settings: config.adapters.clone(),
            adapters: RwLock::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self, adapter_type: AdapterType) -> Option<&AdapterSettings> {
        self.settings.get(&adapter_type)
    }

    fn cached(&self, adapter_type: AdapterType) -> Option<Arc<dyn Adapter>> {
        self.adapters.read().get(&adapter_type).cloned()
    }

    fn init_lock(&self, adapter_type: AdapterType) -> Arc<tokio::sync::Mutex<()>> {
        self.init_locks
            .lock()
            .entry(adapter_type)
            .or_default()
            .clone()
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.adapter_init_failures.inc();
        }
    }

    /// Return the live adapter for `adapter_type`, creating and initializing
    /// it if this is the first request.
    pub async fn get_adapter(
        &self,
        ctx: &CallContext,
        adapter_type: AdapterType,
    ) -> AdapterResult<Arc<dyn Adapter>> {
        if let Some(adapter) = self.cached(adapter_type) {
            return Ok(adapter);
        }

        let lock = self.init_lock(adapter_type);
        let _guard = ctx.run(lock.lock()).await?;

        // Another caller may have finished while we waited.
        if let Some(adapter) = self.cached(adapter_type) {
            return Ok(adapter);
        }

        let settings = self.settings.get(&adapter_type).ok_or_else(|| {
            AdapterError::Configuration(format!("no configuration for adapter type {}", adapter_type))
        })?;

        let adapter = self.factory.create(adapter_type, settings).map_err(|e| {
            warn!(adapter_type = %adapter_type, error = %e, "Adapter construction failed");
            self.record_failure();
            e
        })?;

        if let Err(e) = adapter.initialize(ctx, settings).await {
            warn!(adapter_type = %adapter_type, error = %e, "Adapter initialization failed");
            self.record_failure();
            return Err(e);
        }

        self.adapters.write().insert(adapter_type, adapter.clone());
        if let Some(metrics) = &self.metrics {
            metrics.adapter_initializations.inc();
        }
        info!(adapter_type = %adapter_type, health = %adapter.health(), "Adapter ready");
        Ok(adapter)
    }

    /// Like [`get_adapter`](Self::get_adapter), parsing the type from its key.
    pub async fn get_adapter_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> AdapterResult<Arc<dyn Adapter>> {
        let adapter_type: AdapterType = name.parse()?;
        self.get_adapter(ctx, adapter_type).await
    }

    /// Point-in-time snapshot of live adapters, ordered by type.
    pub fn list_adapters(&self) -> Vec<(AdapterType, Arc<dyn Adapter>)> {
        let mut adapters: Vec<_> = self
            .adapters
            .read()
            .iter()
            .map(|(t, a)| (*t, a.clone()))
            .collect();
        adapters.sort_by_key(|(t, _)| *t);
        adapters
    }

    /// Insert a pre-built adapter, replacing any cached one. The caller is
    /// responsible for having initialized it.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        let adapter_type = adapter.adapter_type();
        info!(adapter_type = %adapter_type, "Adapter registered");
        self.adapters.write().insert(adapter_type, adapter)
    }

    pub fn deregister(&self, adapter_type: AdapterType) -> Option<Arc<dyn Adapter>> {
        self.adapters.write().remove(&adapter_type)
    }

    pub fn contains(&self, adapter_type: AdapterType) -> bool {
        self.adapters.read().contains_key(&adapter_type)
    }
}
