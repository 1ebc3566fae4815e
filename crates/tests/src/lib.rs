//! Integration tests for the dotflow caching and incremental-sync core.
//!
//! Modules:
//!
//! - `mock_infrastructure`: reusable mock upstreams, a mockito-backed
//!   HTTP indexer and a scripted in-process source for multi-page
//!   scenarios.
//! - `incremental_sync_tests`: delta merging, watermark lifecycle,
//!   partial-failure recovery, cursor-rejection fallback.
//! - `batch_isolation_tests`: chunked fan-out, per-key failure isolation,
//!   concurrency budget, stats counters.
//! - `tiered_cache_tests`: TTL expiry across tiers, dependency
//!   invalidation completeness, compression round-trips, warmup.
//! - `client_classification_tests`: the HTTP client's failure taxonomy
//!   against a mock indexer.
//!
//! Run with:
//!
//! ```bash
//! cargo test --package tests
//! ```

pub mod mock_infrastructure;

#[cfg(test)]
mod incremental_sync_tests;


#[cfg(test)]
mod tiered_cache_tests;
