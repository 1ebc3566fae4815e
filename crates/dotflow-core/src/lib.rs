//! # Dotflow Core
//!
//! Caching and incremental-synchronization core for the dotflow
//! account-flow explorer. It sits between application logic (REST routes,
//! graph building, pattern detection) and a rate-limited blockchain-
//! indexing API, minimizing redundant upstream calls while keeping local
//! records fresh.
//!
//! - **[`cache`]**: two-tier cache (bounded in-memory L1 over a durable
//!   `SQLite` L2 with lz4 compression) with dependency-based invalidation
//!   and warmup promotion.
//!
//! - **[`fetch`]**: incremental fetcher tracking a per-key watermark so
//!   only records newer than the last sync are requested, plus a batch
//!   coordinator fanning fetches out under a concurrency/rate budget.
//!
//! - **[`upstream`]**: the indexer client executing single logical
//!   requests with failure classification.
//!
//! - **[`config`]**: layered configuration (defaults → TOML file →
//!   environment) with load-time validation.
//!
//! - **[`runtime`]**: explicit one-time construction; no global caches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       BatchCoordinator                       │
//! │        (chunked fan-out, rate pacing, stats counters)        │
//! └──────────────────────────────────────────────────────────────┘
//!                │
//!       ┌────────▼─────────┐        ┌──────────────────┐
//!       │IncrementalFetcher│───────►│  WatermarkStore  │
//!       │ (delta + merge)  │        │ (per-key cursor) │
//!       └────────┬─────────┘        └──────────────────┘
//!          ┌─────┴──────┐
//!          ▼            ▼
//! ┌───────────────┐ ┌───────────────┐
//! │  TieredCache  │ │ IndexerClient │
//! │  L1 ── L2     │ │ (rate-limited │
//! │  deps index   │ │   upstream)   │
//! └───────────────┘ └───────────────┘
//! ```
//!
//! ## Request flow
//!
//! ```text
//! batch_fetch(keys)
//!       │ chunk, ≤ max_concurrent per chunk
//!       ▼
//! fetch_incremental(key)
//!       │
//!       ▼
//! watermark? ── absent/forced ──► full fetch (capped) ──► establish
//!       │ present
//!       ▼
//! delta pages until boundary or cap ──► merge + dedup ──► advance
//!       │
//!       ▼
//! snapshot written through TieredCache (L1 + compressed L2 row)
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod runtime;
pub mod types;
pub mod upstream;

pub use runtime::{BuildError, CoreBuilder, CoreHandle};
