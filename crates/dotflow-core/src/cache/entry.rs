use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::types::PayloadKind;

/// One cached value as held in the in-memory tier.
///
/// The payload is always the raw (uncompressed) serialized JSON bytes;
/// compression is a property of the durable-store row, applied and stripped
/// at that boundary. Hit counting is best-effort: a lost increment under
/// race affects only statistics, never correctness.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    /// Type discriminator telling consumers which shape to deserialize.
    pub kind: PayloadKind,
    pub payload: Bytes,
    /// Raw serialized size. The compression decision downstream is based on
    /// this value only, independent of TTL.
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Source tables whose mutation invalidates this entry.
    pub dependencies: Vec<String>,
    hit_count: AtomicU64,
}

impl CacheEntry {
    /// Creates an entry expiring `ttl` from now.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        kind: PayloadKind,
        payload: Bytes,
        ttl: Duration,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = payload.len();
        Self {
            key: key.into(),
            kind,
            payload,
            size_bytes,
            created_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()),
            dependencies,
            hit_count: AtomicU64::new(0),
        }
    }

    /// Rebuilds an entry from durable-store fields, preserving its original
    /// lifetime and hit count.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        key: String,
        kind: PayloadKind,
        payload: Bytes,
        size_bytes: usize,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        dependencies: Vec<String>,
        hit_count: u64,
    ) -> Self {
        Self {
            key,
            kind,
            payload,
            size_bytes,
            created_at,
            expires_at,
            dependencies,
            hit_count: AtomicU64::new(hit_count),
        }
    }

    /// Returns a copy of this entry with a tightened expiry, used when
    /// promoting a durable-tier hit into the bounded in-memory tier.
    ///
    /// The promoted copy never outlives the entry itself: the new expiry is
    /// the earlier of `now + l1_ttl` and the original `expires_at`.
    #[must_use]
    pub fn promoted(&self, l1_ttl: Duration) -> Self {
        let promoted_expiry =
            Utc::now() + ChronoDuration::from_std(l1_ttl).unwrap_or(ChronoDuration::zero());
        Self {
            key: self.key.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            expires_at: promoted_expiry.min(self.expires_at),
            dependencies: self.dependencies.clone(),
            hit_count: AtomicU64::new(self.hit_count()),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Best-effort hit increment.
    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the payload does not match
    /// the expected shape; callers treat this as a miss, not a failure.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
