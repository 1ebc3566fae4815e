//! Shared domain types for the dotflow core.
//!
//! Everything that crosses a component boundary lives here: upstream record
//! shapes, cursors, payload discriminators, and the stats snapshot exposed
//! to operational tooling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in the upstream indexer's result ordering.
///
/// The indexer orders records by block number, then by event index within a
/// block. A cursor is rendered as an opaque `"block-index"` token on the
/// wire, but internally it carries the total order needed to compare two
/// positions (the monotonic-watermark invariant depends on it).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Cursor {
    pub block_num: u64,
    pub event_index: u32,
}

impl Cursor {
    #[must_use]
    pub fn new(block_num: u64, event_index: u32) -> Self {
        Self { block_num, event_index }
    }

    /// Renders the wire token accepted by the indexer's `after` parameter.
    #[must_use]
    pub fn token(&self) -> String {
        format!("{}-{}", self.block_num, self.event_index)
    }

    /// Parses a wire token. Returns `None` for malformed input.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let (block, index) = token.split_once('-')?;
        Some(Self { block_num: block.parse().ok()?, event_index: index.parse().ok()? })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.block_num, self.event_index)
    }
}

/// Kind of record set fetched per address key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Balance transfers to/from an address.
    Transfers,
    /// Signed extrinsics submitted by an address.
    Extrinsics,
    /// Staking rewards paid to an address.
    Rewards,
}

impl RecordKind {
    /// Indexer endpoint path for this record kind.
    #[must_use]
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Transfers => "transfers",
            Self::Extrinsics => "extrinsics",
            Self::Rewards => "rewards",
        }
    }

    /// Source-table name used in cache dependency sets.
    ///
    /// Any collaborator mutating this table invalidates the entries that
    /// registered it as a dependency.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Transfers => "transfers",
            Self::Extrinsics => "extrinsics",
            Self::Rewards => "rewards",
        }
    }

    /// Static string for log fields and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.endpoint()
    }
}

/// One domain record as served by the indexing API.
///
/// Amounts stay as decimal strings: planck-denominated values routinely
/// exceed `u64` and the core never does arithmetic on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Extrinsic hash, when the indexer provides one. Empty for synthetic
    /// events (e.g. some reward payouts).
    #[serde(default)]
    pub extrinsic_hash: String,
    pub from: String,
    pub to: String,
    pub amount: String,
    pub block_num: u64,
    pub event_index: u32,
    /// Unix timestamp of the containing block.
    pub timestamp: i64,
    #[serde(default = "default_success")]
    pub success: bool,
    /// Runtime module that emitted the record (e.g. `balances`, `staking`).
    #[serde(default)]
    pub module: String,
}

fn default_success() -> bool {
    true
}

impl TransferRecord {
    /// Upstream position of this record.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.block_num, self.event_index)
    }

    /// Stable identity used for deduplication across fetches.
    ///
    /// The extrinsic hash is authoritative when present; otherwise a
    /// composite of counterparts, amount, and chain position stands in.
    #[must_use]
    pub fn identity(&self) -> String {
        if self.extrinsic_hash.is_empty() {
            format!(
                "{}:{}:{}:{}:{}",
                self.from, self.to, self.amount, self.block_num, self.event_index
            )
        } else {
            format!("{}:{}", self.extrinsic_hash, self.event_index)
        }
    }
}

/// Sorts records into the explicit ordering contract: newest first by
/// `(block_num, event_index)` descending.
///
/// Callers must never rely on insertion order for recency.
pub fn sort_newest_first(records: &mut [TransferRecord]) {
    records.sort_unstable_by(|a, b| b.cursor().cmp(&a.cursor()));
}

/// Discriminator stored alongside every cached payload.
///
/// Payloads are serialized JSON; the discriminator tells consumers which
/// shape to deserialize into instead of duck-typing the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A record-set snapshot maintained by the incremental fetcher.
    RecordSet,
    /// An ad-hoc query result cached via `cache_query`.
    Query,
    /// A rendered relationship graph.
    Graph,
    /// Detected behavioral patterns for an address.
    Patterns,
    /// A relationship score.
    Score,
}

impl PayloadKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordSet => "record_set",
            Self::Query => "query",
            Self::Graph => "graph",
            Self::Patterns => "patterns",
            Self::Score => "score",
        }
    }

    /// Parses the discriminator as persisted in durable-store rows.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "record_set" => Some(Self::RecordSet),
            "query" => Some(Self::Query),
            "graph" => Some(Self::Graph),
            "patterns" => Some(Self::Patterns),
            "score" => Some(Self::Score),
            _ => None,
        }
    }
}

/// Cache usage counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Entries currently resident in the in-memory tier.
    pub l1_entries: usize,
    /// Keys tracked by the dependency index.
    pub indexed_keys: usize,
    /// Keys with an established watermark.
    pub watermarks: usize,
}

/// Request timing counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    /// Decaying average response time in milliseconds, smoothed as
    /// `(old + sample) / 2`.
    pub avg_response_ms: u64,
}

/// Upstream-call avoidance counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EfficiencyStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub incremental_fetches: u64,
    pub full_fetches: u64,
    /// Fraction of reads served without an upstream call.
    pub cache_hit_ratio: f64,
    /// Fraction of upstream syncs that were bounded delta fetches.
    pub incremental_ratio: f64,
}

/// Snapshot returned by `stats()`, consumed by operational tooling and
/// tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreStats {
    pub usage: UsageStats,
    pub performance: PerformanceStats,
    pub efficiency: EfficiencyStats,
}
