use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{
        compression,
        entry::CacheEntry,
        memory::{MemoryCache, MemoryCacheError},
        store::{DurableStore, StoredEntry},
    },
    types::PayloadKind,
};

/// Fixed TTLs bound by the named read-through wrappers.
const QUERY_TTL: Duration = Duration::from_secs(300);
const GRAPH_TTL: Duration = Duration::from_secs(600);
const PATTERNS_TTL: Duration = Duration::from_secs(900);
const SCORE_TTL: Duration = Duration::from_secs(1800);

/// Errors that occur during tiered cache construction.
#[derive(Debug, Error)]
pub enum TieredCacheError {
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl From<MemoryCacheError> for TieredCacheError {
    fn from(e: MemoryCacheError) -> Self {
        match e {
            MemoryCacheError::InvalidConfig(msg) => Self::InvalidConfig(msg),
        }
    }
}

/// Configuration for the two-tier cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TieredCacheConfig {
    /// Maximum entries resident in the in-memory tier (default: 1000).
    pub l1_capacity: usize,
    /// Lifetime of an in-memory entry, including promoted ones (default: 5 minutes).
    pub l1_ttl: Duration,
    /// Default durable-tier lifetime when a caller does not bind its own
    /// (default: 1 hour). Must be at least `l1_ttl`, since the durable
    /// tier backs promotion into memory.
    pub default_ttl: Duration,
    /// Raw payload size above which durable rows are compressed (default: 1KB).
    pub compression_threshold: usize,
    /// Keys deleted per invalidation batch (default: 50).
    pub invalidation_batch_size: usize,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            l1_ttl: Duration::from_secs(300),
            default_ttl: Duration::from_secs(3600),
            compression_threshold: 1024,
            invalidation_batch_size: 50,
        }
    }
}

/// Write options for one cache entry.
#[derive(Debug, Clone)]
pub struct CacheWriteOptions {
    /// Entry lifetime in the durable tier. Zero disables caching entirely
    /// for this entry: `get` is a miss and `set` a no-op passthrough.
    pub ttl: Duration,
    pub kind: PayloadKind,
    /// Source tables whose mutation invalidates the entry.
    pub dependencies: Vec<String>,
}

impl CacheWriteOptions {
    #[must_use]
    pub fn new(kind: PayloadKind, ttl: Duration) -> Self {
        Self { ttl, kind, dependencies: Vec::new() }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Result of a dependency invalidation pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvalidationReport {
    pub invalidated: usize,
    pub table: String,
}

/// Two-tier cache: bounded in-memory L1 backed by a durable L2.
///
/// Reads check L1 first, then L2; an L2 hit is promoted into L1 with the
/// configured L1 TTL. Writes go through both tiers, compressing the durable
/// row above the size threshold. Dependency registrations happen *before*
/// the value writes, so a concurrent `invalidate_by_table` can never miss
/// an entry that is mid-write.
///
/// The durable tier is best-effort: any L2 failure degrades that call to
/// L1-only behavior and is never surfaced to callers.
pub struct TieredCache {
    l1: MemoryCache,
    l2: Arc<dyn DurableStore>,
    /// table -> keys registered against it.
    dependency_index: DashMap<String, HashSet<String>, RandomState>,
    config: TieredCacheConfig,

    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l2_errors: AtomicU64,
    invalidated_total: AtomicU64,
}

impl TieredCache {
    /// Creates the cache over a durable store.
    ///
    /// # Errors
    ///
    /// Returns `TieredCacheError::InvalidConfig` for a zero L1 capacity, a
    /// zero invalidation batch size, or a default TTL shorter than the L1
    /// TTL.
    pub fn new(
        config: TieredCacheConfig,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self, TieredCacheError> {
        if config.invalidation_batch_size == 0 {
            return Err(TieredCacheError::InvalidConfig(
                "invalidation_batch_size must be non-zero".to_string(),
            ));
        }
        if config.default_ttl < config.l1_ttl {
            return Err(TieredCacheError::InvalidConfig(
                "default_ttl must be at least l1_ttl".to_string(),
            ));
        }

        Ok(Self {
            l1: MemoryCache::new(config.l1_capacity)?,
            l2: store,
            dependency_index: DashMap::with_hasher(RandomState::new()),
            config,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            l2_errors: AtomicU64::new(0),
            invalidated_total: AtomicU64::new(0),
        })
    }

    /// Looks up a live entry: L1 first, then L2 with promotion.
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.l1.get(key).await {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        match self.l2.get(key).await {
            Ok(Some(stored)) => match self.revive(stored) {
                Some(entry) => {
                    self.l2_hits.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.l2.touch_hit(key).await {
                        debug!(key, error = %e, "l2 hit-count bump failed");
                    }
                    let promoted = Arc::new(entry.promoted(self.config.l1_ttl));
                    promoted.record_hit();
                    self.l1.insert(Arc::clone(&promoted)).await;
                    Some(promoted)
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                // Degrade to L1-only; never propagate.
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "l2 read failed, degrading to l1-only");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Writes through both tiers.
    ///
    /// A zero TTL turns the call into a no-op passthrough. L2 write
    /// failures are logged and absorbed; L1 stays authoritative until its
    /// copy expires.
    pub async fn set(&self, key: &str, payload: Bytes, options: CacheWriteOptions) {
        if options.ttl.is_zero() {
            debug!(key, "zero ttl, cache bypassed");
            return;
        }

        // Write-ahead dependency registration.
        self.register_dependencies(key, &options.dependencies);

        let entry = CacheEntry::new(
            key,
            options.kind,
            payload,
            options.ttl,
            options.dependencies,
        );

        let stored = self.to_stored(&entry);
        self.l1.insert(Arc::new(entry.promoted(self.config.l1_ttl))).await;

        if let Err(e) = self.l2.put(&stored).await {
            self.l2_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "l2 write failed, entry held in l1 only");
        }
    }

    /// Generic read-through: returns the cached value for `key` or runs
    /// `fetcher` and caches its result.
    ///
    /// Cache-tier problems (corrupt payloads, store failures) degrade to a
    /// plain fetch; the only error surfaced is the fetcher's own.
    ///
    /// # Errors
    ///
    /// Propagates exactly the fetcher's error when the fetch runs and
    /// fails.
    pub async fn get_or_fetch<T, E, F, Fut>(
        &self,
        key: &str,
        options: CacheWriteOptions,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !options.ttl.is_zero() {
            if let Some(entry) = self.get(key).await {
                match entry.decode::<T>() {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        warn!(key, error = %e, "cached payload undecodable, refetching");
                    }
                }
            }
        }

        let value = fetcher().await?;

        match serde_json::to_vec(&value) {
            Ok(bytes) => self.set(key, Bytes::from(bytes), options).await,
            Err(e) => warn!(key, error = %e, "value not cacheable, returning uncached"),
        }

        Ok(value)
    }

    /// Read-through for an ad-hoc query result, keyed by the caller's query
    /// fingerprint and invalidated by the tables it read.
    ///
    /// # Errors
    ///
    /// Propagates the fetcher's error.
    pub async fn cache_query<T, E, F, Fut>(
        &self,
        query_key: &str,
        tables: &[&str],
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheWriteOptions::new(PayloadKind::Query, QUERY_TTL)
            .with_dependencies(tables.iter().map(ToString::to_string).collect());
        self.get_or_fetch(&format!("query:{query_key}"), options, fetcher).await
    }

    /// Read-through for a rendered relationship graph.
    ///
    /// # Errors
    ///
    /// Propagates the fetcher's error.
    pub async fn cached_graph<T, E, F, Fut>(&self, address: &str, fetcher: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheWriteOptions::new(PayloadKind::Graph, GRAPH_TTL).with_dependencies(
            vec!["transfers".to_string(), "accounts".to_string()],
        );
        self.get_or_fetch(&format!("graph:{address}"), options, fetcher).await
    }

    /// Read-through for detected behavioral patterns.
    ///
    /// # Errors
    ///
    /// Propagates the fetcher's error.
    pub async fn cached_patterns<T, E, F, Fut>(&self, address: &str, fetcher: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheWriteOptions::new(PayloadKind::Patterns, PATTERNS_TTL)
            .with_dependencies(vec!["transfers".to_string()]);
        self.get_or_fetch(&format!("patterns:{address}"), options, fetcher).await
    }

    /// Read-through for a relationship score between two addresses.
    ///
    /// # Errors
    ///
    /// Propagates the fetcher's error.
    pub async fn cached_score<T, E, F, Fut>(
        &self,
        from: &str,
        to: &str,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheWriteOptions::new(PayloadKind::Score, SCORE_TTL).with_dependencies(
            vec!["transfers".to_string(), "account_relationships".to_string()],
        );
        self.get_or_fetch(&format!("score:{from}:{to}"), options, fetcher).await
    }

    /// Removes every entry whose dependency set contains `table` from both
    /// tiers.
    ///
    /// Keys come from the union of the in-memory dependency index and the
    /// durable store's registrations, then are deleted in bounded batches
    /// (no long-lived locks); the invalidation counter advances per batch,
    /// not per key. Each batch commits fully before the next begins.
    pub async fn invalidate_by_table(&self, table: &str) -> InvalidationReport {
        let mut keys: HashSet<String> = self
            .dependency_index
            .get(table)
            .map(|set| set.clone())
            .unwrap_or_default();

        match self.l2.scan_by_dependency(table).await {
            Ok(stored_keys) => keys.extend(stored_keys),
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(table, error = %e, "l2 dependency scan failed, invalidating l1 view only");
            }
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let mut invalidated = 0usize;

        for batch in keys.chunks(self.config.invalidation_batch_size) {
            self.l1.remove_many(batch).await;

            if let Err(e) = self.l2.delete_many(batch).await {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(table, error = %e, "l2 batch delete failed");
            }

            // A key may be registered against several tables; drop it from
            // every set, not just the invalidated one.
            for mut index_entry in self.dependency_index.iter_mut() {
                for key in batch {
                    index_entry.value_mut().remove(key);
                }
            }

            invalidated += batch.len();
            self.invalidated_total.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }

        self.dependency_index.retain(|_, set| !set.is_empty());

        info!(table, invalidated, "dependency invalidation complete");
        InvalidationReport { invalidated, table: table.to_string() }
    }

    /// Promotes the most frequently hit durable entries into L1.
    ///
    /// Returns the number of entries promoted. Store failures make this a
    /// no-op.
    pub async fn warmup(&self, limit: usize) -> usize {
        let keys = match self.l2.top_hit_keys(limit).await {
            Ok(keys) => keys,
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "warmup scan failed");
                return 0;
            }
        };

        let mut promoted = 0usize;
        for key in keys {
            if self.l1.contains(&key).await {
                continue;
            }
            match self.l2.get(&key).await {
                Ok(Some(stored)) => {
                    if let Some(entry) = self.revive(stored) {
                        self.register_dependencies(&key, &entry.dependencies);
                        self.l1.insert(Arc::new(entry.promoted(self.config.l1_ttl))).await;
                        promoted += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.l2_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, error = %e, "warmup read failed");
                }
            }
        }

        info!(promoted, "cache warmup complete");
        promoted
    }

    /// Drops every in-memory entry. The durable tier is untouched.
    pub async fn clear_memory(&self) {
        self.l1.clear().await;
    }

    pub async fn l1_entries(&self) -> usize {
        self.l1.len().await
    }

    /// Distinct keys currently registered in the dependency index.
    #[must_use]
    pub fn indexed_key_count(&self) -> usize {
        let mut keys: HashSet<String> = HashSet::new();
        for entry in &self.dependency_index {
            keys.extend(entry.value().iter().cloned());
        }
        keys.len()
    }

    /// `(l1_hits, l2_hits, misses)` counters since construction.
    #[must_use]
    pub fn hit_counts(&self) -> (u64, u64, u64) {
        (
            self.l1_hits.load(Ordering::Relaxed),
            self.l2_hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn l2_error_count(&self) -> u64 {
        self.l2_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn invalidated_count(&self) -> u64 {
        self.invalidated_total.load(Ordering::Relaxed)
    }

    fn register_dependencies(&self, key: &str, dependencies: &[String]) {
        for table in dependencies {
            self.dependency_index
                .entry(table.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn to_stored(&self, entry: &CacheEntry) -> StoredEntry {
        let (blob, compressed) =
            compression::maybe_compress(&entry.payload, self.config.compression_threshold);
        StoredEntry {
            key: entry.key.clone(),
            kind: entry.kind,
            blob,
            compressed,
            size_bytes: entry.size_bytes,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            hit_count: entry.hit_count(),
            dependencies: entry.dependencies.clone(),
        }
    }

    /// Converts a durable row back into a live entry, dropping it on
    /// decompression failure.
    fn revive(&self, stored: StoredEntry) -> Option<CacheEntry> {
        match compression::decompress(&stored.blob, stored.compressed) {
            Ok(raw) => Some(CacheEntry::from_parts(
                stored.key,
                stored.kind,
                Bytes::from(raw),
                stored.size_bytes,
                stored.created_at,
                stored.expires_at,
                stored.dependencies,
                stored.hit_count,
            )),
            Err(e) => {
                warn!(key = %stored.key, error = %e, "dropping corrupt l2 row");
                None
            }
        }
    }
}
