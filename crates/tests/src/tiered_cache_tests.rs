//! Integration tests for the tiered cache: expiry in both tiers,
//! dependency invalidation completeness, compression round-trips, warmup
//! promotion, and durable-tier sharing across cache instances.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dotflow_core::{
    cache::{
        CacheWriteOptions, DurableStore, SqliteStore, TieredCache, TieredCacheConfig,
    },
    types::PayloadKind,
};
use serde_json::json;

fn short_ttl_config() -> TieredCacheConfig {
    TieredCacheConfig {
        l1_ttl: Duration::from_millis(40),
        default_ttl: Duration::from_millis(40),
        ..Default::default()
    }
}

fn options(ttl: Duration, deps: &[&str]) -> CacheWriteOptions {
    CacheWriteOptions::new(PayloadKind::Query, ttl)
        .with_dependencies(deps.iter().map(ToString::to_string).collect())
}

async fn cache_over(store: Arc<SqliteStore>, config: TieredCacheConfig) -> TieredCache {
    TieredCache::new(config, store as Arc<dyn DurableStore>).expect("valid cache config")
}

#[tokio::test]
async fn test_entry_expires_in_both_tiers() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(Arc::clone(&store), short_ttl_config()).await;

    cache.set("k", Bytes::from_static(b"\"payload\""), options(Duration::from_millis(40), &[])).await;
    assert!(cache.get("k").await.is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;

    // Miss from L1 (expired and evicted) and from L2 (expired row).
    assert!(cache.get("k").await.is_none());
    assert!(store.get("k").await.expect("store reachable").is_none());
}

#[tokio::test]
async fn test_invalidation_removes_exactly_the_dependents() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(store, TieredCacheConfig::default()).await;

    // 3 of 10 entries depend on transfers.
    for i in 0..3 {
        cache
            .set(&format!("dep{i}"), Bytes::from_static(b"1"), options(Duration::from_secs(60), &["transfers"]))
            .await;
    }
    for i in 0..7 {
        cache
            .set(&format!("other{i}"), Bytes::from_static(b"1"), options(Duration::from_secs(60), &["accounts"]))
            .await;
    }

    let report = cache.invalidate_by_table("transfers").await;
    assert_eq!(report.invalidated, 3);
    assert_eq!(report.table, "transfers");

    for i in 0..3 {
        assert!(cache.get(&format!("dep{i}")).await.is_none());
    }
    for i in 0..7 {
        assert!(cache.get(&format!("other{i}")).await.is_some());
    }
}

#[tokio::test]
async fn test_invalidation_reaches_l2_only_entries() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));

    // Populate through one cache instance, invalidate through another:
    // the second instance's in-memory index has never seen the keys, so
    // only the durable side table can find them.
    let writer = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;
    writer
        .set("snapshot", Bytes::from_static(b"1"), options(Duration::from_secs(60), &["transfers"]))
        .await;

    let invalidator = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;
    let report = invalidator.invalidate_by_table("transfers").await;
    assert_eq!(report.invalidated, 1);

    let reader = cache_over(store, TieredCacheConfig::default()).await;
    assert!(reader.get("snapshot").await.is_none());
}

#[tokio::test]
async fn test_compression_round_trip_is_byte_exact() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;

    let rows: Vec<serde_json::Value> = (0..200)
        .map(|i| json!({ "from": "alice", "to": "bob", "amount": i.to_string(), "block": i }))
        .collect();
    let payload = Bytes::from(serde_json::to_vec(&rows).expect("serializable"));
    assert!(payload.len() > 1024, "payload exceeds the compression threshold");

    cache.set("big", payload.clone(), options(Duration::from_secs(60), &[])).await;

    // The durable row really is compressed.
    let stored = store.get("big").await.expect("store reachable").expect("row present");
    assert!(stored.compressed);
    assert!(stored.blob.len() < payload.len());

    // And a fresh cache instance restores the exact bytes from L2.
    let reader = cache_over(store, TieredCacheConfig::default()).await;
    let entry = reader.get("big").await.expect("served from l2");
    assert_eq!(entry.payload, payload);
}

#[tokio::test]
async fn test_small_payload_stays_uncompressed_in_l2() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;

    cache.set("small", Bytes::from_static(b"[1,2,3]"), options(Duration::from_secs(60), &[])).await;

    let stored = store.get("small").await.expect("store reachable").expect("row present");
    assert!(!stored.compressed);
}

#[tokio::test]
async fn test_l2_backs_promotion_after_l1_pressure() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let config = TieredCacheConfig { l1_capacity: 2, ..Default::default() };
    let cache = cache_over(store, config).await;

    for i in 0..5 {
        cache
            .set(&format!("k{i}"), Bytes::from(format!("{i}")), options(Duration::from_secs(60), &[]))
            .await;
    }

    // k0 was evicted from the bounded L1 long ago; L2 still serves it.
    let entry = cache.get("k0").await.expect("promoted from l2");
    assert_eq!(entry.payload, Bytes::from_static(b"0"));

    let (_, l2_hits, _) = cache.hit_counts();
    assert!(l2_hits >= 1);
}

#[tokio::test]
async fn test_warmup_prefers_frequently_hit_entries() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;

    for key in ["hot1", "hot2", "cold1", "cold2", "cold3"] {
        cache.set(key, Bytes::from_static(b"1"), options(Duration::from_secs(60), &[])).await;
    }
    for _ in 0..4 {
        store.touch_hit("hot1").await.expect("touch succeeds");
        store.touch_hit("hot2").await.expect("touch succeeds");
    }

    let fresh = cache_over(store, TieredCacheConfig::default()).await;
    let promoted = fresh.warmup(2).await;

    assert_eq!(promoted, 2);
    assert_eq!(fresh.l1_entries().await, 2);
}

#[tokio::test]
async fn test_read_through_wrappers_round_trip_typed_values() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Score {
        total: f64,
        volume: f64,
    }

    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(store, TieredCacheConfig::default()).await;

    let computed: Result<Score, String> = cache
        .cached_score("alice", "bob", || async { Ok(Score { total: 87.5, volume: 40.0 }) })
        .await;
    assert_eq!(computed.expect("computed"), Score { total: 87.5, volume: 40.0 });

    // Second call is served from cache; a fetcher that runs would panic.
    let cached: Result<Score, String> = cache
        .cached_score("alice", "bob", || async { panic!("must not recompute") })
        .await;
    assert_eq!(cached.expect("cached"), Score { total: 87.5, volume: 40.0 });
}

#[tokio::test]
async fn test_zero_ttl_is_a_passthrough() {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store opens"));
    let cache = cache_over(Arc::clone(&store), TieredCacheConfig::default()).await;

    let mut calls = 0u32;
    for _ in 0..2 {
        let value: Result<u32, String> = cache
            .get_or_fetch("uncachable", options(Duration::ZERO, &[]), || {
                calls += 1;
                async { Ok(7) }
            })
            .await;
        assert_eq!(value.expect("fetched"), 7);
    }

    assert_eq!(calls, 2, "every read goes to the fetcher");
    assert!(store.get("uncachable").await.expect("store reachable").is_none());
}
