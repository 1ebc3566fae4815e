//! Scripted upstream source shared by fetcher and coordinator tests.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use crate::{
    types::{Cursor, RecordKind, TransferRecord},
    upstream::{FetchPage, IndexerError, RecordSource},
};

/// One recorded `fetch_page` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptedCall {
    pub key: String,
    pub after: Option<Cursor>,
    pub resume: Option<Cursor>,
}

/// Replays scripted page results and records every call.
///
/// Responses come from a per-key script when one exists, otherwise from
/// the global queue. An exhausted script yields a server error, which
/// keeps a runaway pagination loop visible in test output.
pub(crate) struct ScriptedSource {
    global: StdMutex<VecDeque<Result<FetchPage, IndexerError>>>,
    keyed: StdMutex<HashMap<String, VecDeque<Result<FetchPage, IndexerError>>>>,
    calls: StdMutex<Vec<ScriptedCall>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<FetchPage, IndexerError>>) -> Self {
        Self {
            global: StdMutex::new(responses.into()),
            keyed: StdMutex::new(HashMap::new()),
            calls: StdMutex::new(Vec::new()),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn keyed() -> Self {
        Self::new(Vec::new())
    }

    pub fn script(self, key: &str, responses: Vec<Result<FetchPage, IndexerError>>) -> Self {
        self.keyed.lock().expect("keyed lock").insert(key.to_string(), responses.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// `(after, resume)` pairs in call order.
    pub fn call_args(&self) -> Vec<(Option<Cursor>, Option<Cursor>)> {
        self.calls().into_iter().map(|c| (c.after, c.resume)).collect()
    }

    /// Peak number of concurrently in-flight calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch_page(
        &self,
        key: &str,
        _kind: RecordKind,
        after: Option<Cursor>,
        resume: Option<Cursor>,
        _limit: usize,
    ) -> Result<FetchPage, IndexerError> {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.calls
            .lock()
            .expect("calls lock")
            .push(ScriptedCall { key: key.to_string(), after, resume });

        let response = {
            let mut keyed = self.keyed.lock().expect("keyed lock");
            match keyed.get_mut(key) {
                Some(queue) => queue.pop_front(),
                None => self.global.lock().expect("global lock").pop_front(),
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);

        response
            .unwrap_or_else(|| Err(IndexerError::ServerError("script exhausted".to_string())))
    }
}

/// Builds a well-formed test record at the given chain position.
pub(crate) fn record(block: u64, index: u32) -> TransferRecord {
    TransferRecord {
        extrinsic_hash: format!("0x{block:04x}{index:02x}"),
        from: "alice".into(),
        to: "bob".into(),
        amount: "500".into(),
        block_num: block,
        event_index: index,
        timestamp: 1_700_000_000 + block as i64,
        success: true,
        module: "balances".into(),
    }
}

/// Wraps records into a successful page result.
pub(crate) fn page(
    records: Vec<TransferRecord>,
    next: Option<Cursor>,
) -> Result<FetchPage, IndexerError> {
    let total = records.len() as u64;
    Ok(FetchPage { records, next_cursor: next, total_count: total })
}
