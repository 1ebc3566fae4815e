//! Incremental synchronization against the rate-limited indexer.
//!
//! # Components
//!
//! - [`watermark`]: per-key high-water marks with an explicit lifecycle
//!   (`Absent → Established → Advanced ⟲ → StaleRejected → Absent`).
//! - [`incremental`]: the [`IncrementalFetcher`], which answers "all
//!   records of kind K for key A" by merging the cached snapshot with a
//!   bounded delta fetch.
//! - [`batch`]: the [`BatchCoordinator`], fanning fetches out across many
//!   keys in rate-limited chunks and aggregating statistics.
//!
//! # Data flow
//!
//! ```text
//! batch_fetch(keys)
//!   └─ chunk keys (batch_size) ── settle chunk, delay, next chunk
//!        └─ per key (≤ max_concurrent): fetch_incremental
//!             ├─ snapshot  ← TieredCache
//!             ├─ watermark ← WatermarkStore
//!             ├─ delta     ← IndexerClient (pages until boundary or cap)
//!             └─ merge, dedup, write snapshot back, advance watermark
//! ```
//!
//! # Ordering guarantees
//!
//! Per key, fetches are strictly serialized: the watermark update of one
//! call completes before that key's next call begins. Across keys within a
//! chunk there is no ordering, and none is needed.

pub mod batch;
pub mod incremental;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchCoordinator, BatchOptions};
pub use incremental::{
    FetchError, FetchOptions, FetchOutcome, FetcherConfig, IncrementalFetcher,
};
pub use watermark::{Watermark, WatermarkState, WatermarkStore};
