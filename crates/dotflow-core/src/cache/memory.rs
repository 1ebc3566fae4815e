use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

use crate::cache::entry::CacheEntry;

/// Errors that occur during in-memory cache initialization.
#[derive(Debug, Error)]
pub enum MemoryCacheError {
    /// Invalid configuration parameter (typically zero capacity).
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Bounded in-process cache tier.
///
/// LRU-evicted with per-entry TTL enforced on read: an expired entry is
/// popped and reported as a miss, so nothing is retrievable past its
/// `expires_at`. All methods are safe under concurrent access; hit/miss
/// counters are best-effort atomics.
pub struct MemoryCache {
    entries: RwLock<LruCache<String, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// Creates a cache bounded to `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns `MemoryCacheError::InvalidConfig` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, MemoryCacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            MemoryCacheError::InvalidConfig("l1_capacity must be non-zero".to_string())
        })?;

        Ok(Self {
            entries: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Looks up a live entry, evicting it if expired.
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let mut entries = self.entries.write().await;
        let cached = entries.get(key).map(Arc::clone);
        match cached {
            Some(entry) if !entry.is_expired() => {
                drop(entries);
                entry.record_hit();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                trace!(key, "evicting expired l1 entry");
                entries.pop(key);
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, entry: Arc<CacheEntry>) {
        let mut entries = self.entries.write().await;
        entries.put(entry.key.clone(), entry);
    }

    pub async fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.pop(key).is_some()
    }

    /// Removes a batch of keys under a single lock acquisition.
    pub async fn remove_many(&self, keys: &[String]) -> usize {
        let mut entries = self.entries.write().await;
        keys.iter().filter(|key| entries.pop(key.as_str()).is_some()).count()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Returns `true` without counting a hit or touching LRU order. Used by
    /// warmup to skip already-resident keys.
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.peek(key).is_some()
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
