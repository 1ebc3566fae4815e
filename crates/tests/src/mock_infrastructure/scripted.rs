//! In-process scripted upstream for multi-page and multi-key scenarios.
//!
//! HTTP-level behavior is covered against the mockito server; these
//! scripts drive the fetcher and coordinator through exact page sequences
//! (continuations, mid-fetch failures, per-key scripts) that a stateless
//! HTTP mock cannot express.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use dotflow_core::{
    types::{Cursor, RecordKind, TransferRecord},
    upstream::{FetchPage, IndexerError, RecordSource},
};

/// One recorded `fetch_page` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub key: String,
    pub kind: RecordKind,
    pub after: Option<Cursor>,
    pub resume: Option<Cursor>,
}

/// Replays per-key scripts of page results and records every call.
pub struct ScriptedIndexer {
    scripts: Mutex<HashMap<String, VecDeque<Result<FetchPage, IndexerError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedIndexer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Queues the page results served for `key`, in order.
    #[must_use]
    pub fn script(self, key: &str, responses: Vec<Result<FetchPage, IndexerError>>) -> Self {
        self.scripts.lock().expect("scripts lock").insert(key.to_string(), responses.into());
        self
    }

    /// Adds artificial latency per call, for concurrency assertions.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Peak number of concurrently in-flight calls observed.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedIndexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSource for ScriptedIndexer {
    async fn fetch_page(
        &self,
        key: &str,
        kind: RecordKind,
        after: Option<Cursor>,
        resume: Option<Cursor>,
        _limit: usize,
    ) -> Result<FetchPage, IndexerError> {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.calls.lock().expect("calls lock").push(RecordedCall {
            key: key.to_string(),
            kind,
            after,
            resume,
        });

        let response = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(key)
            .and_then(VecDeque::pop_front);

        self.active.fetch_sub(1, Ordering::SeqCst);

        response
            .unwrap_or_else(|| Err(IndexerError::ServerError("script exhausted".to_string())))
    }
}

/// Builds a well-formed record at the given chain position.
#[must_use]
pub fn record(block: u64, index: u32) -> TransferRecord {
    TransferRecord {
        extrinsic_hash: format!("0x{block:04x}{index:02x}"),
        from: "alice".into(),
        to: "bob".into(),
        amount: "1000000000".into(),
        block_num: block,
        event_index: index,
        timestamp: 1_700_000_000 + block as i64,
        success: true,
        module: "balances".into(),
    }
}

/// Wraps records into a successful page result.
#[must_use]
pub fn page(
    records: Vec<TransferRecord>,
    next: Option<Cursor>,
) -> Result<FetchPage, IndexerError> {
    let total = records.len() as u64;
    Ok(FetchPage { records, next_cursor: next, total_count: total })
}
