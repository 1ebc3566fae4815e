use futures::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::{
    fetch::incremental::{FetchError, FetchOptions, FetchOutcome, IncrementalFetcher},
    types::{CoreStats, EfficiencyStats, PerformanceStats, RecordKind, UsageStats},
};

/// Options for one batch fan-out.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Keys per chunk; chunks run strictly one after another (default: 20).
    pub batch_size: usize,
    /// Concurrent fetches within a chunk (default: 5).
    pub max_concurrent: usize,
    /// Pause between chunks, spreading load under the upstream's rate
    /// limit (default: 200ms).
    pub chunk_delay: Duration,
    /// Per-key fetch options forwarded to the incremental fetcher.
    pub fetch: FetchOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent: 5,
            chunk_delay: Duration::from_millis(200),
            fetch: FetchOptions::default(),
        }
    }
}

/// Fans incremental fetches out across many keys under a concurrency and
/// rate budget.
///
/// Keys are partitioned into ordered chunks; within a chunk up to
/// `max_concurrent` fetches run concurrently and the whole chunk settles
/// (success or error per key, independently) before the next chunk starts.
/// A single key's failure never aborts the batch.
pub struct BatchCoordinator {
    fetcher: Arc<IncrementalFetcher>,
    total_requests: AtomicU64,
    /// Decaying average response time, smoothed as `(old + sample) / 2`.
    /// Deliberately crude; the formula is an observable metric and is
    /// preserved as-is.
    avg_response_ms: AtomicU64,
}

impl BatchCoordinator {
    #[must_use]
    pub fn new(fetcher: Arc<IncrementalFetcher>) -> Self {
        Self {
            fetcher,
            total_requests: AtomicU64::new(0),
            avg_response_ms: AtomicU64::new(0),
        }
    }

    /// Fetches `keys` in rate-limited chunks, returning one result slot
    /// per key.
    ///
    /// A failed key occupies its slot with the error (its record set is
    /// empty by construction); sibling keys in the same chunk are
    /// unaffected. Abandoning the returned future lets in-flight chunk
    /// work finish but schedules no further chunks.
    pub async fn batch_fetch(
        &self,
        keys: &[String],
        kind: RecordKind,
        options: &BatchOptions,
    ) -> HashMap<String, Result<FetchOutcome, FetchError>> {
        let batch_size = options.batch_size.max(1);
        let max_concurrent = options.max_concurrent.max(1);

        info!(
            keys = keys.len(),
            kind = kind.as_str(),
            batch_size,
            max_concurrent,
            "starting batch fetch"
        );

        let mut results: HashMap<String, Result<FetchOutcome, FetchError>> =
            HashMap::with_capacity(keys.len());

        let chunks: Vec<&[String]> = keys.chunks(batch_size).collect();
        let last_chunk = chunks.len().saturating_sub(1);

        for (index, chunk) in chunks.into_iter().enumerate() {
            let semaphore = Arc::new(Semaphore::new(max_concurrent));

            let fetches = chunk.iter().map(|key| {
                let semaphore = Arc::clone(&semaphore);
                let fetcher = Arc::clone(&self.fetcher);
                let fetch_options = options.fetch;
                async move {
                    // Closing is impossible here; a failed acquire still
                    // isolates to this key's slot.
                    let _permit = semaphore.acquire_owned().await;
                    let started = Instant::now();
                    let result = fetcher.fetch_incremental(key, kind, fetch_options).await;
                    (key.clone(), started.elapsed(), result)
                }
            });

            for (key, elapsed, result) in join_all(fetches).await {
                self.record_sample(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
                if let Err(e) = &result {
                    debug!(key = %key, error = %e, "batch key failed");
                }
                results.insert(key, result);
            }

            if index != last_chunk && !options.chunk_delay.is_zero() {
                tokio::time::sleep(options.chunk_delay).await;
            }
        }

        let failed = results.values().filter(|r| r.is_err()).count();
        info!(keys = keys.len(), failed, "batch fetch settled");
        results
    }

    /// Point-in-time snapshot of usage, performance, and efficiency
    /// counters.
    #[allow(clippy::cast_precision_loss)]
    pub async fn stats(&self) -> CoreStats {
        let cache = self.fetcher.cache();
        let (l1_hits, l2_hits, misses) = cache.hit_counts();
        let hits = l1_hits + l2_hits;
        let lookups = hits + misses;

        let incremental = self.fetcher.incremental_count();
        let full = self.fetcher.full_count();
        let syncs = incremental + full;

        CoreStats {
            usage: UsageStats {
                l1_entries: cache.l1_entries().await,
                indexed_keys: cache.indexed_key_count(),
                watermarks: self.fetcher.watermark_count(),
            },
            performance: PerformanceStats {
                total_requests: self.total_requests.load(Ordering::Relaxed),
                avg_response_ms: self.avg_response_ms.load(Ordering::Relaxed),
            },
            efficiency: EfficiencyStats {
                cache_hits: hits,
                cache_misses: misses,
                incremental_fetches: incremental,
                full_fetches: full,
                cache_hit_ratio: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
                incremental_ratio: if syncs == 0 {
                    0.0
                } else {
                    incremental as f64 / syncs as f64
                },
            },
        }
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<IncrementalFetcher> {
        &self.fetcher
    }

    fn record_sample(&self, sample_ms: u64) {
        let previous_total = self.total_requests.fetch_add(1, Ordering::Relaxed);
        if previous_total == 0 {
            self.avg_response_ms.store(sample_ms, Ordering::Relaxed);
        } else {
            let _ = self.avg_response_ms.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |old| Some((old + sample_ms) / 2),
            );
        }
    }
}
