//! Reusable mock upstreams for integration tests.

pub mod scripted;

pub use indexer_mock::IndexerMockBuilder;
pub use scripted::{page, record, ScriptedIndexer};
