//! Integration tests for incremental synchronization: watermark lifecycle,
//! delta merging, partial-failure recovery, and cursor-rejection fallback,
//! all through the assembled core.

use std::sync::Arc;

use dotflow_core::{
    cache::SqliteStore,
    config::AppConfig,
    fetch::{FetchOptions, WatermarkState},
    types::{Cursor, RecordKind},
    upstream::{IndexerError, RecordSource},
    CoreBuilder, CoreHandle,
};

use crate::mock_infrastructure::{page, record, ScriptedIndexer};

async fn handle_with(source: ScriptedIndexer) -> (Arc<ScriptedIndexer>, CoreHandle) {
    let source = Arc::new(source);
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let handle = CoreBuilder::from_config(AppConfig::default())
        .with_source(Arc::clone(&source) as Arc<dyn RecordSource>)
        .with_store(store)
        .build()
        .await
        .expect("core builds");
    (source, handle)
}

#[tokio::test]
async fn test_first_fetch_then_delta_merges_new_record() {
    // First call: upstream serves [r1(newest), r2, r3], no continuation.
    // Second call: r0 arrived; the delta page contains only r0.
    let (source, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(30, 1), record(20, 0), record(10, 0)], None),
                page(vec![record(40, 0)], None),
            ],
        ),
    )
    .await;

    let first = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");
    assert_eq!(first.records.len(), 3);
    assert_eq!(first.watermark, Some(Cursor::new(30, 1)));
    assert!(first.full_refetch);

    let second = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("delta fetch");

    assert!(!second.full_refetch);
    assert_eq!(second.fetched, 1, "only the delta page was fetched");
    assert_eq!(second.records.len(), 4);
    assert_eq!(second.records[0].cursor(), Cursor::new(40, 0));
    assert_eq!(second.watermark, Some(Cursor::new(40, 0)));

    // The delta request carried the previous watermark as its boundary.
    let calls = source.calls();
    assert_eq!(calls[1].after, Some(Cursor::new(30, 1)));
}

#[tokio::test]
async fn test_idempotent_fetches_with_no_new_data() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(30, 0), record(20, 0)], None),
                page(vec![], None),
                page(vec![], None),
            ],
        ),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    let first = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("first probe");
    let wm_first = handle.fetcher.watermark("addrA", RecordKind::Transfers).expect("present");

    let second = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("second probe");
    let wm_second = handle.fetcher.watermark("addrA", RecordKind::Transfers).expect("present");

    // Identical record sets; only last_fetched_at moved.
    assert_eq!(first.records, second.records);
    assert_eq!(wm_first.cursor, wm_second.cursor);
    assert!(wm_second.last_fetched_at >= wm_first.last_fetched_at);
    assert_eq!(wm_second.state, WatermarkState::Advanced);
}

#[tokio::test]
async fn test_multi_page_delta_until_boundary() {
    let (source, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(10, 0)], None),
                // Two delta pages before the boundary is reached.
                page(vec![record(30, 0)], Some(Cursor::new(25, 0))),
                page(vec![record(20, 0)], None),
            ],
        ),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    let outcome = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("paged delta");

    assert_eq!(outcome.fetched, 2);
    assert!(!outcome.has_more);
    assert_eq!(outcome.watermark, Some(Cursor::new(30, 0)));

    // Page 2 resumed from page 1's continuation cursor.
    let calls = source.calls();
    assert_eq!(calls[2].resume, Some(Cursor::new(25, 0)));
    assert_eq!(calls[2].after, Some(Cursor::new(10, 0)));
}

#[tokio::test]
async fn test_partial_delta_returns_accumulated_and_holds_watermark() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(10, 0)], None),
                page(vec![record(30, 0)], Some(Cursor::new(25, 0))),
                Err(IndexerError::Timeout),
            ],
        ),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    let outcome = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("partial outcome");

    assert!(outcome.partial);
    assert!(outcome.records.iter().any(|r| r.block_num == 30));
    // Never corrupted to a mid-delta position.
    assert_eq!(outcome.watermark, Some(Cursor::new(10, 0)));
}

#[tokio::test]
async fn test_cursor_rejection_triggers_full_refetch() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(10, 0)], None),
                Err(IndexerError::InvalidCursor("pruned".to_string())),
                page(vec![record(50, 0), record(40, 0)], None),
            ],
        ),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    let outcome = handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("rejection handled inside the call");

    assert!(outcome.full_refetch);
    assert_eq!(outcome.watermark, Some(Cursor::new(50, 0)));
    let wm = handle.fetcher.watermark("addrA", RecordKind::Transfers).expect("present");
    assert_eq!(wm.state, WatermarkState::Established, "fresh watermark after reset");
}

#[tokio::test]
async fn test_empty_result_distinguished_from_failed_fetch() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new()
            .script("empty", vec![page(vec![], None)])
            .script("broken", vec![Err(IndexerError::ServerError("boom".to_string()))]),
    )
    .await;

    let empty = handle
        .fetcher
        .fetch_incremental("empty", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("no data is success");
    assert!(empty.records.is_empty());
    assert!(!empty.partial);

    let failed = handle
        .fetcher
        .fetch_incremental("broken", RecordKind::Transfers, FetchOptions::default())
        .await;
    assert!(failed.is_err(), "failure is an error, never an empty success");
}

#[tokio::test]
async fn test_snapshot_survives_fetcher_restart_via_durable_tier() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));

    // First process lifetime: fetch and cache three records.
    let source = Arc::new(ScriptedIndexer::new().script(
        "addrA",
        vec![page(vec![record(30, 0), record(20, 0), record(10, 0)], None)],
    ));
    let handle = CoreBuilder::from_config(AppConfig::default())
        .with_source(Arc::clone(&source) as Arc<dyn RecordSource>)
        .with_store(Arc::clone(&store) as Arc<dyn dotflow_core::cache::DurableStore>)
        .build()
        .await
        .expect("core builds");
    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    // Second lifetime over the same store: the watermark is gone, so a
    // capped full refetch runs, but cached records merge back in.
    let source2 = Arc::new(
        ScriptedIndexer::new().script("addrA", vec![page(vec![record(40, 0)], None)]),
    );
    let handle2 = CoreBuilder::from_config(AppConfig::default())
        .with_source(Arc::clone(&source2) as Arc<dyn RecordSource>)
        .with_store(Arc::clone(&store) as Arc<dyn dotflow_core::cache::DurableStore>)
        .build()
        .await
        .expect("second core builds");

    let outcome = handle2
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("refetch after restart");

    assert!(outcome.full_refetch);
    assert_eq!(outcome.records.len(), 4, "upstream page merged with durable snapshot");
    assert_eq!(outcome.from_cache, 3);
}

#[tokio::test]
async fn test_force_refresh_discards_stale_snapshot() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new().script(
            "addrA",
            vec![
                page(vec![record(30, 0), record(20, 0)], None),
                page(vec![record(30, 0)], None),
            ],
        ),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("initial fetch");

    let outcome = handle
        .fetcher
        .fetch_incremental(
            "addrA",
            RecordKind::Transfers,
            FetchOptions { force_refresh: true, ..Default::default() },
        )
        .await
        .expect("forced refetch");

    // Record 20 no longer exists upstream and was not resurrected from
    // the cache.
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].block_num, 30);
}

#[tokio::test]
async fn test_record_kinds_sync_independently() {
    let (_, handle) = handle_with(
        ScriptedIndexer::new()
            .script("addrA", vec![page(vec![record(10, 0)], None)]),
    )
    .await;

    handle
        .fetcher
        .fetch_incremental("addrA", RecordKind::Transfers, FetchOptions::default())
        .await
        .expect("transfers fetch");

    assert!(handle.fetcher.watermark("addrA", RecordKind::Transfers).is_some());
    assert!(
        handle.fetcher.watermark("addrA", RecordKind::Rewards).is_none(),
        "rewards watermark untouched"
    );
}
