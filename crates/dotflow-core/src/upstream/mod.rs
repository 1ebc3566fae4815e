//! Client for the remote blockchain-indexing API.
//!
//! The indexer is the single upstream collaborator of this core: a
//! rate-limited HTTP API serving per-address record pages with cursor
//! pagination. This module owns exactly two things:
//!
//! - [`IndexerClient`]: executes one logical request, nothing more. No
//!   caching, no watermark logic, no batching.
//! - [`IndexerError`]: the failure taxonomy the rest of the core dispatches
//!   on (`RateLimited` / `Timeout` / `InvalidCursor` / `ServerError` /
//!   `Network` / `InvalidResponse`).

pub mod client;
pub mod errors;

pub use client::{FetchPage, IndexerClient, IndexerClientConfig, RecordSource};
pub use errors::{ApiErrorCategory, IndexerError};
