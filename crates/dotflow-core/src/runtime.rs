//! Explicit construction and wiring of one core instance.
//!
//! There is deliberately no ambient global: [`CoreBuilder`] assembles the
//! client, store, cache, fetcher, and coordinator exactly once, and every
//! consumer receives the resulting [`CoreHandle`] by reference or clone.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::{
    cache::{DurableStore, InvalidationReport, SqliteStore, StoreError, TieredCache, TieredCacheError},
    config::AppConfig,
    fetch::{BatchCoordinator, FetchError, IncrementalFetcher},
    types::CoreStats,
    upstream::{IndexerClient, IndexerError, RecordSource},
};

/// Errors from core construction.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("indexer client: {0}")]
    Client(#[from] IndexerError),

    #[error("durable store: {0}")]
    Store(#[from] StoreError),

    #[error("tiered cache: {0}")]
    Cache(#[from] TieredCacheError),

    #[error("fetcher: {0}")]
    Fetcher(#[from] FetchError),
}

/// Builder assembling the core from configuration.
///
/// The upstream source and durable store can be overridden before
/// building, which is how tests inject mocks and how embedders swap the
/// storage backend.
pub struct CoreBuilder {
    config: AppConfig,
    source: Option<Arc<dyn RecordSource>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl CoreBuilder {
    #[must_use]
    pub fn from_config(config: AppConfig) -> Self {
        Self { config, source: None, store: None }
    }

    /// Overrides the upstream source (defaults to an [`IndexerClient`]
    /// built from config).
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Overrides the durable store (defaults to a [`SqliteStore`] at the
    /// configured database URL).
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the wired core.
    ///
    /// # Errors
    ///
    /// Returns `BuildError` when any component rejects its configuration
    /// or the durable store cannot be opened.
    pub async fn build(self) -> Result<CoreHandle, BuildError> {
        let source: Arc<dyn RecordSource> = match self.source {
            Some(source) => source,
            None => Arc::new(IndexerClient::new(self.config.indexer.client_config())?),
        };

        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::new(&self.config.cache.database_url).await?),
        };

        let cache = Arc::new(TieredCache::new(self.config.cache.tiered_config(), store)?);
        let fetcher = Arc::new(IncrementalFetcher::new(
            source,
            Arc::clone(&cache),
            self.config.fetch.fetcher_config(),
        )?);
        let coordinator = Arc::new(BatchCoordinator::new(Arc::clone(&fetcher)));

        info!("core assembled");
        Ok(CoreHandle { config: self.config, cache, fetcher, coordinator })
    }
}

/// Handle to the assembled core, passed explicitly to every consumer.
#[derive(Clone)]
pub struct CoreHandle {
    pub config: AppConfig,
    pub cache: Arc<TieredCache>,
    pub fetcher: Arc<IncrementalFetcher>,
    pub coordinator: Arc<BatchCoordinator>,
}

impl CoreHandle {
    /// Invalidates every cache entry depending on `table`; called by any
    /// collaborator that mutates underlying records.
    pub async fn invalidate_by_table(&self, table: &str) -> InvalidationReport {
        self.cache.invalidate_by_table(table).await
    }

    /// Stats snapshot for operational tooling.
    pub async fn stats(&self) -> CoreStats {
        self.coordinator.stats().await
    }

    /// Promotes frequently hit durable entries into memory, typically at
    /// startup.
    pub async fn warmup(&self, limit: usize) -> usize {
        self.cache.warmup(limit).await
    }
}
