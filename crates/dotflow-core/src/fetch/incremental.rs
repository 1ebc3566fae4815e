use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheWriteOptions, TieredCache},
    fetch::watermark::{Watermark, WatermarkStore},
    types::{sort_newest_first, Cursor, PayloadKind, RecordKind, TransferRecord},
    upstream::{IndexerError, RecordSource},
};

/// Configuration for incremental fetching.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FetcherConfig {
    /// Records requested per upstream page (default: 100).
    pub page_size: usize,
    /// Page cap for one delta fetch; bounds worst-case latency when a key
    /// fell far behind (default: 5).
    pub max_delta_pages: usize,
    /// Page cap for a full fetch of a new or force-refreshed key
    /// (default: 10).
    pub max_full_pages: usize,
    /// Durable lifetime of the merged record-set snapshot (default: 1 hour).
    pub snapshot_ttl: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_delta_pages: 5,
            max_full_pages: 10,
            snapshot_ttl: Duration::from_secs(3600),
        }
    }
}

/// Per-call options for [`IncrementalFetcher::fetch_incremental`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Caps the records returned to the caller. The cached snapshot keeps
    /// everything.
    pub limit: Option<usize>,
    /// Discards the watermark and cached snapshot, forcing a full refetch.
    pub force_refresh: bool,
}

/// Result of one incremental fetch.
///
/// `partial`, `from_cache`, and `fetched` let callers distinguish "empty
/// because no data exists" from "empty because the fetch failed partway".
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub key: String,
    pub kind: RecordKind,
    /// Deduplicated records, newest first.
    pub records: Vec<TransferRecord>,
    /// Watermark cursor after this call, absent only when the upstream has
    /// no records for the key and none were cached.
    pub watermark: Option<Cursor>,
    /// A page cap stopped pagination before the upstream ran out of pages.
    pub has_more: bool,
    /// A page failed mid-fetch; `records` holds what was accumulated and
    /// the watermark stayed at its last safe position.
    pub partial: bool,
    /// Records served from the cached snapshot.
    pub from_cache: usize,
    /// Records received from the upstream in this call.
    pub fetched: usize,
    /// This call performed a full refetch rather than a bounded delta.
    pub full_refetch: bool,
}

/// Errors from the incremental fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid fetcher configuration: {0}")]
    InvalidConfig(String),

    /// The upstream call failed before any page succeeded; there is no
    /// partial data to return.
    #[error("fetch for {key} failed: {source}")]
    Upstream {
        key: String,
        #[source]
        source: IndexerError,
    },
}

impl FetchError {
    /// The underlying upstream error, when this is a per-key fetch failure.
    #[must_use]
    pub fn upstream_error(&self) -> Option<&IndexerError> {
        match self {
            Self::Upstream { source, .. } => Some(source),
            Self::InvalidConfig(_) => None,
        }
    }
}

/// Answers "all records of kind K for key A" with the minimum upstream
/// work.
///
/// Combines the cached snapshot with a delta bounded by the key's
/// watermark. Per-key fetches are strictly serialized: a key's watermark
/// update completes before its next fetch may begin. Across keys there is
/// no ordering.
pub struct IncrementalFetcher {
    source: Arc<dyn RecordSource>,
    cache: Arc<TieredCache>,
    watermarks: WatermarkStore,
    /// Per-sync-key fetch guards enforcing one in-flight fetch per key.
    guards: DashMap<String, Arc<Mutex<()>>, RandomState>,
    config: FetcherConfig,

    incremental_fetches: AtomicU64,
    full_fetches: AtomicU64,
    partial_fetches: AtomicU64,
}

impl IncrementalFetcher {
    /// Creates a fetcher over an upstream source and the tiered cache.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidConfig` for zero page sizes or caps.
    pub fn new(
        source: Arc<dyn RecordSource>,
        cache: Arc<TieredCache>,
        config: FetcherConfig,
    ) -> Result<Self, FetchError> {
        if config.page_size == 0 {
            return Err(FetchError::InvalidConfig("page_size must be non-zero".to_string()));
        }
        if config.max_delta_pages == 0 || config.max_full_pages == 0 {
            return Err(FetchError::InvalidConfig("page caps must be non-zero".to_string()));
        }

        Ok(Self {
            source,
            cache,
            watermarks: WatermarkStore::new(),
            guards: DashMap::with_hasher(RandomState::new()),
            config,
            incremental_fetches: AtomicU64::new(0),
            full_fetches: AtomicU64::new(0),
            partial_fetches: AtomicU64::new(0),
        })
    }

    /// Returns all records of `kind` for `key`, deduplicated and newest
    /// first, fetching only what the watermark does not already cover.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Upstream` only when the upstream fails before
    /// any page succeeded; a mid-fetch failure yields a `partial` outcome
    /// instead.
    pub async fn fetch_incremental(
        &self,
        key: &str,
        kind: RecordKind,
        options: FetchOptions,
    ) -> Result<FetchOutcome, FetchError> {
        let sync_key = format!("{}:{}", kind.as_str(), key);

        let guard = self
            .guards
            .entry(sync_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = guard.lock().await;

        if options.force_refresh {
            // Explicit reset path: watermark back to absent, snapshot
            // discarded.
            self.watermarks.reset(&sync_key);
            return self.full_fetch(key, kind, &sync_key, Vec::new(), options, true).await;
        }

        let snapshot = self.load_snapshot(&sync_key).await;
        match self.watermarks.get(&sync_key) {
            None => self.full_fetch(key, kind, &sync_key, snapshot, options, false).await,
            Some(watermark) => {
                self.delta_fetch(key, kind, &sync_key, snapshot, &watermark, options).await
            }
        }
    }

    /// Watermark for a key, exposed for diagnostics and tests.
    #[must_use]
    pub fn watermark(&self, key: &str, kind: RecordKind) -> Option<Watermark> {
        self.watermarks.get(&format!("{}:{}", kind.as_str(), key))
    }

    #[must_use]
    pub fn watermark_count(&self) -> usize {
        self.watermarks.len()
    }

    #[must_use]
    pub fn incremental_count(&self) -> u64 {
        self.incremental_fetches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn full_count(&self) -> u64 {
        self.full_fetches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn partial_count(&self) -> u64 {
        self.partial_fetches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Bounded delta fetch against an established watermark.
    async fn delta_fetch(
        &self,
        key: &str,
        kind: RecordKind,
        sync_key: &str,
        snapshot: Vec<TransferRecord>,
        watermark: &Watermark,
        options: FetchOptions,
    ) -> Result<FetchOutcome, FetchError> {
        let boundary = watermark.cursor;
        let mut fresh: Vec<TransferRecord> = Vec::new();
        let mut resume: Option<Cursor> = None;
        let mut pages = 0usize;
        let mut partial = false;
        let mut has_more = false;

        loop {
            if pages == self.config.max_delta_pages {
                debug!(key = sync_key, pages, "delta page cap reached");
                has_more = true;
                break;
            }

            match self
                .source
                .fetch_page(key, kind, Some(boundary), resume, self.config.page_size)
                .await
            {
                Ok(page) => {
                    pages += 1;
                    // The boundary is exclusive upstream too; the filter
                    // keeps the merge sound if a page straddles it.
                    fresh.extend(page.records.into_iter().filter(|r| r.cursor() > boundary));
                    match page.next_cursor {
                        None => break,
                        Some(cursor) => resume = Some(cursor),
                    }
                }
                Err(e) if e.is_cursor_rejection() => {
                    info!(key = sync_key, "cursor rejected, falling back to full refetch");
                    self.watermarks.mark_rejected(sync_key);
                    self.watermarks.reset(sync_key);
                    return self.full_fetch(key, kind, sync_key, Vec::new(), options, true).await;
                }
                Err(e) if pages == 0 => {
                    return Err(FetchError::Upstream { key: sync_key.to_string(), source: e });
                }
                Err(e) => {
                    warn!(key = sync_key, pages, error = %e, "delta interrupted, returning partial");
                    partial = true;
                    break;
                }
            }
        }

        self.incremental_fetches.fetch_add(1, Ordering::Relaxed);

        let newest_fetched = fresh.iter().map(TransferRecord::cursor).max();
        let fetched = fresh.len();
        let (merged, added) = merge_records(fresh, snapshot);
        let from_cache = merged.len() - added;

        self.save_snapshot(sync_key, kind, &merged).await;

        if partial {
            self.partial_fetches.fetch_add(1, Ordering::Relaxed);
        } else {
            // Advances even on an empty delta, refreshing last_fetched_at.
            self.watermarks.advance(sync_key, newest_fetched, added as u64);
        }

        Ok(FetchOutcome {
            key: key.to_string(),
            kind,
            records: apply_limit(merged, options.limit),
            watermark: self.watermarks.get(sync_key).map(|w| w.cursor),
            has_more,
            partial,
            from_cache,
            fetched,
            full_refetch: false,
        })
    }

    /// Capped full fetch: absent watermark, forced refresh, or cursor
    /// rejection fallback.
    async fn full_fetch(
        &self,
        key: &str,
        kind: RecordKind,
        sync_key: &str,
        snapshot: Vec<TransferRecord>,
        options: FetchOptions,
        replace_snapshot: bool,
    ) -> Result<FetchOutcome, FetchError> {
        let mut fetched_records: Vec<TransferRecord> = Vec::new();
        let mut resume: Option<Cursor> = None;
        let mut pages = 0usize;
        let mut partial = false;
        let mut has_more = false;

        loop {
            if pages == self.config.max_full_pages {
                debug!(key = sync_key, pages, "full-fetch page cap reached");
                has_more = true;
                break;
            }
            if options.limit.is_some_and(|limit| fetched_records.len() >= limit) {
                has_more = true;
                break;
            }

            match self.source.fetch_page(key, kind, None, resume, self.config.page_size).await {
                Ok(page) => {
                    pages += 1;
                    fetched_records.extend(page.records);
                    match page.next_cursor {
                        None => break,
                        Some(cursor) => resume = Some(cursor),
                    }
                }
                Err(e) if pages == 0 => {
                    // A full refetch that fails entirely is a hard failure
                    // for this key.
                    return Err(FetchError::Upstream { key: sync_key.to_string(), source: e });
                }
                Err(e) => {
                    warn!(key = sync_key, pages, error = %e, "full fetch interrupted, returning partial");
                    partial = true;
                    break;
                }
            }
        }

        self.full_fetches.fetch_add(1, Ordering::Relaxed);

        let newest_fetched = fetched_records.iter().map(TransferRecord::cursor).max();
        let fetched = fetched_records.len();
        let base = if replace_snapshot { Vec::new() } else { snapshot };
        let (merged, added) = merge_records(fetched_records, base);
        let from_cache = merged.len() - added;

        self.save_snapshot(sync_key, kind, &merged).await;

        if partial {
            self.partial_fetches.fetch_add(1, Ordering::Relaxed);
        } else {
            // An empty upstream still establishes a zero watermark so the
            // next call is a cheap delta probe instead of another full
            // crawl.
            self.watermarks.establish(sync_key, newest_fetched.unwrap_or_default(), added as u64);
        }

        Ok(FetchOutcome {
            key: key.to_string(),
            kind,
            records: apply_limit(merged, options.limit),
            watermark: self.watermarks.get(sync_key).map(|w| w.cursor),
            has_more,
            partial,
            from_cache,
            fetched,
            full_refetch: true,
        })
    }

    async fn load_snapshot(&self, sync_key: &str) -> Vec<TransferRecord> {
        match self.cache.get(&snapshot_key(sync_key)).await {
            Some(entry) => match entry.decode::<Vec<TransferRecord>>() {
                Ok(records) => records,
                Err(e) => {
                    warn!(key = sync_key, error = %e, "snapshot undecodable, starting empty");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    async fn save_snapshot(&self, sync_key: &str, kind: RecordKind, records: &[TransferRecord]) {
        match serde_json::to_vec(records) {
            Ok(bytes) => {
                let options =
                    CacheWriteOptions::new(PayloadKind::RecordSet, self.config.snapshot_ttl)
                        .with_dependencies(vec![kind.table().to_string()]);
                self.cache.set(&snapshot_key(sync_key), Bytes::from(bytes), options).await;
            }
            Err(e) => warn!(key = sync_key, error = %e, "snapshot not serializable"),
        }
    }
}

fn snapshot_key(sync_key: &str) -> String {
    format!("records:{sync_key}")
}

fn apply_limit(records: Vec<TransferRecord>, limit: Option<usize>) -> Vec<TransferRecord> {
    match limit {
        Some(limit) if records.len() > limit => records.into_iter().take(limit).collect(),
        _ => records,
    }
}

/// Prepends fresh records onto the snapshot, dropping exact duplicates by
/// stable identity, and sorts the union newest first.
///
/// Returns the merged records and how many fresh records were genuinely
/// new.
fn merge_records(
    fresh: Vec<TransferRecord>,
    snapshot: Vec<TransferRecord>,
) -> (Vec<TransferRecord>, usize) {
    let snapshot_ids: HashSet<String> = snapshot.iter().map(TransferRecord::identity).collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(fresh.len() + snapshot.len());
    let mut merged: Vec<TransferRecord> = Vec::with_capacity(fresh.len() + snapshot.len());
    let mut added = 0usize;

    for record in fresh {
        let id = record.identity();
        if seen.insert(id.clone()) {
            if !snapshot_ids.contains(&id) {
                added += 1;
            }
            merged.push(record);
        }
    }
    for record in snapshot {
        if seen.insert(record.identity()) {
            merged.push(record);
        }
    }

    sort_newest_first(&mut merged);
    (merged, added)
}
