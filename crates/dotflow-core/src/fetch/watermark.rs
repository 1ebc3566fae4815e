use ahash::RandomState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::Cursor;

/// Lifecycle state of a key's watermark.
///
/// ```text
/// ABSENT ──first successful fetch──► ESTABLISHED
/// ESTABLISHED/ADVANCED ──successful fetch──► ADVANCED (looping)
/// any ──upstream rejects cursor──► STALE_REJECTED ──forced reset──► ABSENT
/// ```
///
/// No transition regresses the cursor except the explicit reset path back
/// to absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkState {
    /// Created by the first successful fetch.
    Established,
    /// Updated by a subsequent successful fetch.
    Advanced,
    /// The upstream rejected the stored cursor; awaiting reset.
    StaleRejected,
}

/// High-water mark for one sync key.
///
/// Bounds incremental fetches: only records strictly newer than `cursor`
/// need to be requested. `last_fetched_at` refreshes on every successful
/// fetch, even an empty one, so repeated no-op probes stay cheap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub key: String,
    pub cursor: Cursor,
    pub state: WatermarkState,
    pub last_fetched_at: DateTime<Utc>,
    /// Records fetched for this key across its watermark lifetime.
    pub record_count: u64,
}

/// In-memory watermark registry, one entry per sync key.
///
/// Process-lifetime only: a restart leaves every key absent, costing one
/// capped full refetch per key. Absence is represented by a missing entry.
#[derive(Default)]
pub struct WatermarkStore {
    inner: DashMap<String, Watermark, RandomState>,
}

impl WatermarkStore {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: DashMap::with_hasher(RandomState::new()) }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Watermark> {
        self.inner.get(key).map(|w| w.clone())
    }

    /// Creates the watermark after a first successful fetch
    /// (`Absent → Established`). Overwrites any previous state, which only
    /// exists here after an explicit reset raced with re-establishment.
    pub fn establish(&self, key: &str, cursor: Cursor, record_count: u64) {
        debug!(key, %cursor, record_count, "watermark established");
        self.inner.insert(
            key.to_string(),
            Watermark {
                key: key.to_string(),
                cursor,
                state: WatermarkState::Established,
                last_fetched_at: Utc::now(),
                record_count,
            },
        );
    }

    /// Advances the watermark after a successful fetch.
    ///
    /// `newest` carries the newest fetched record's cursor; `None` records
    /// an empty delta, refreshing only `last_fetched_at`. A cursor older
    /// than the current one never regresses the watermark.
    pub fn advance(&self, key: &str, newest: Option<Cursor>, added: u64) {
        match self.inner.get_mut(key) {
            Some(mut wm) => {
                if let Some(cursor) = newest {
                    if cursor < wm.cursor {
                        warn!(key, current = %wm.cursor, rejected = %cursor,
                            "ignoring watermark regression");
                    } else {
                        wm.cursor = cursor;
                    }
                }
                wm.state = WatermarkState::Advanced;
                wm.last_fetched_at = Utc::now();
                wm.record_count += added;
            }
            None => {
                // Advance without establishment only happens if a reset
                // raced this fetch; re-establish from what we have.
                self.establish(key, newest.unwrap_or_default(), added);
            }
        }
    }

    /// Marks the cursor as rejected by the upstream (`→ StaleRejected`).
    pub fn mark_rejected(&self, key: &str) {
        if let Some(mut wm) = self.inner.get_mut(key) {
            warn!(key, cursor = %wm.cursor, "upstream rejected watermark cursor");
            wm.state = WatermarkState::StaleRejected;
        }
    }

    /// Forced reset back to absent, triggering a full refetch next call.
    pub fn reset(&self, key: &str) {
        if self.inner.remove(key).is_some() {
            debug!(key, "watermark reset to absent");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
