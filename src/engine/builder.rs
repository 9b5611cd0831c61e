//! Cache engine builder with pluggable store and backend

use super::traits::{CacheStore, TsdbBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::observability::CacheMetrics;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for wiring the cache engine to a store and a backend
pub struct CacheEngineBuilder {
    store: Option<Arc<dyn CacheStore>>,
    backend: Option<Arc<dyn TsdbBackend>>,
    metrics: Option<Arc<CacheMetrics>>,
    config: Config,
}

impl CacheEngineBuilder {
    /// Create a new engine builder
    pub fn new() -> Self {
        Self {
            store: None,
            backend: None,
            metrics: None,
            config: Config::default(),
        }
    }

    /// Set the cache store implementation
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: CacheStore + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set an already shared cache store
    pub fn with_shared_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the backend implementation
    pub fn with_backend<B>(mut self, backend: B) -> Self
    where
        B: TsdbBackend + 'static,
    {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Set an already shared backend
    pub fn with_shared_backend(mut self, backend: Arc<dyn TsdbBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Share a metrics registry with other components
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    ///
    /// An unreachable store is not an error: the engine then behaves as a
    /// plain proxy until the store comes back.
    pub async fn build(self) -> Result<CacheEngine> {
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("No cache store configured".to_string()))?;

        let backend = self
            .backend
            .ok_or_else(|| Error::Configuration("No backend configured".to_string()))?;

        match store.ping().await {
            Ok(()) => info!(store = store.store_id(), "Cache store reachable"),
            Err(e) => warn!(store = store.store_id(), error = %e, "Cache store unreachable, serving as proxy"),
        }

        Ok(CacheEngine {
            store,
            backend,
            metrics: self.metrics.unwrap_or_default(),
            config: Arc::new(self.config),
        })
    }
}

impl Default for CacheEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles shared by every cache operation
///
/// Cheap to clone; constructed once at startup and passed explicitly.
#[derive(Clone)]
pub struct CacheEngine {
    store: Arc<dyn CacheStore>,
    backend: Arc<dyn TsdbBackend>,
    metrics: Arc<CacheMetrics>,
    config: Arc<Config>,
}

impl CacheEngine {
    /// Get reference to the cache store
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Get reference to the backend
    pub fn backend(&self) -> &Arc<dyn TsdbBackend> {
        &self.backend
    }

    /// Get reference to the metrics registry
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
