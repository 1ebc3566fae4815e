//! Two-tier caching system with dependency-based invalidation.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        TieredCache                         │
//! │   (read/write-through, dependency index, invalidation)     │
//! └────────────────────────────────────────────────────────────┘
//!            │                                │
//!    ┌───────▼────────┐              ┌────────▼────────┐
//!    │  MemoryCache   │              │  DurableStore   │
//!    │  (L1)          │              │  (L2)           │
//!    │ • bounded LRU  │              │ • SQLite rows   │
//!    │ • TTL on read  │              │ • lz4 > 1KB     │
//!    │ • hit counters │              │ • dep side table│
//!    └────────────────┘              └─────────────────┘
//! ```
//!
//! # Tier contract
//!
//! Reads check L1 first; an L2 hit is promoted into L1 with the configured
//! L1 TTL (never outliving the entry's own expiry). Writes go through both
//! tiers unconditionally, with the durable row lz4-compressed above a raw
//! size threshold. Nothing is retrievable past its `expires_at` in either
//! tier.
//!
//! # Dependency invalidation
//!
//! Every entry registers the source tables it was derived from *before*
//! its value writes (write-ahead registration), so a concurrent
//! `invalidate_by_table` can never miss a mid-write entry. Invalidation
//! unions the in-memory index with the durable side table and deletes in
//! bounded batches, committing each batch before the next begins.
//!
//! # Failure semantics
//!
//! The durable tier is strictly best-effort. Every L2 failure (read,
//! write, scan, delete) degrades that call to L1-only behavior, is
//! counted and logged, and never reaches business logic. An entry whose L1
//! write succeeded but whose L2 write failed is served from memory until
//! its L1 copy expires (accepted eventual inconsistency).
//!
//! # Error handling conventions
//!
//! - `Option<T>`: cache miss (expected, not an error)
//! - `Result<T, E>`: initialization and store-internal operations
//! - `get_or_fetch` surfaces only the fetcher's own error type

pub mod compression;
pub mod entry;
pub mod memory;
pub mod store;
pub mod tiered;

pub use entry::CacheEntry;
pub use memory::{MemoryCache, MemoryCacheError};
pub use store::{DurableStore, SqliteStore, StoreError, StoredEntry};
pub use tiered::{
    CacheWriteOptions, InvalidationReport, TieredCache, TieredCacheConfig, TieredCacheError,
};
