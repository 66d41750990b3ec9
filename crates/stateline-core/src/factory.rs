//! Context factory
//!
//! Owns what every execution context of a process shares: the metadata
//! registry, the storage adapter, the L2 cache and the default context
//! configuration.

use std::sync::Arc;

use tracing::info;

use crate::cache::{Level2Cache, Level2CacheRegistry};
use crate::config::{ContextConfig, FactoryConfig};
use crate::context::{ExecutionContext, SharedExecutionContext};
use crate::errors::Result;
use crate::model::MetadataRegistry;
use crate::storage::StoreManager;
use crate::tracker::{DefaultTrackerFactory, TrackerFactory};

pub struct ContextFactory {
    metadata: Arc<MetadataRegistry>,
    store: Arc<dyn StoreManager>,
    l2: Arc<dyn Level2Cache>,
    trackers: Arc<dyn TrackerFactory>,
    config: FactoryConfig,
}

impl std::fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextFactory")
            .field("store", &self.store.name())
            .field("l2", &self.l2.name())
            .field("config", &self.config)
            .finish()
    }
}

impl ContextFactory {
    /// Build a factory with the L2 backend named in `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown backend, a zero capacity or an
    /// invalid default context configuration.
    pub fn new(
        metadata: MetadataRegistry,
        store: Arc<dyn StoreManager>,
        config: FactoryConfig,
    ) -> Result<Self> {
        Self::with_registry(metadata, store, config, &Level2CacheRegistry::with_builtins())
    }

    /// Build a factory resolving the L2 backend through `registry`
    ///
    /// # Errors
    ///
    /// Same as [`ContextFactory::new`].
    pub fn with_registry(
        metadata: MetadataRegistry,
        store: Arc<dyn StoreManager>,
        config: FactoryConfig,
        registry: &Level2CacheRegistry,
    ) -> Result<Self> {
        config.context.validate()?;
        let l2 = registry.create(&config.l2_backend, config.l2_capacity)?;
        info!(
            store = store.name(),
            l2_backend = %config.l2_backend,
            l2_capacity = config.l2_capacity,
            "context factory created"
        );
        Ok(Self {
            metadata: Arc::new(metadata),
            store,
            l2,
            trackers: Arc::new(DefaultTrackerFactory),
            config,
        })
    }

    pub fn with_tracker_factory(mut self, trackers: Arc<dyn TrackerFactory>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Open a context with the default configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration fails validation.
    pub fn open(&self) -> Result<ExecutionContext> {
        self.open_with(self.config.context.clone())
    }

    /// Open a context with an explicit configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn open_with(&self, config: ContextConfig) -> Result<ExecutionContext> {
        let ctx = ExecutionContext::new(
            Arc::clone(&self.metadata),
            Arc::clone(&self.store),
            Arc::clone(&self.l2),
            config,
        )?;
        Ok(ctx.with_tracker_factory(Arc::clone(&self.trackers)))
    }

    /// Open a context behind the re-entrant lock
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration fails validation.
    pub fn open_shared(&self) -> Result<SharedExecutionContext> {
        let mut config = self.config.context.clone();
        config.multithreaded = true;
        Ok(SharedExecutionContext::new(self.open_with(config)?))
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn store(&self) -> &Arc<dyn StoreManager> {
        &self.store
    }

    pub fn l2(&self) -> &Arc<dyn Level2Cache> {
        &self.l2
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }
}
