use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::PayloadKind;

/// Errors from the durable cache tier.
///
/// Store errors are always absorbed by the tiered cache: a degraded store
/// behaves as a slower passthrough and never propagates to business logic.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database is unavailable or rejected the operation.
    #[error("Durable store unavailable: {0}")]
    Io(#[from] sqlx::Error),

    /// A persisted row violates the storage contract.
    #[error("Corrupt cache row: {0}")]
    Corrupt(String),
}

/// One row of the durable tier.
///
/// `blob` may be lz4-compressed (flagged by `compressed`); `size_bytes`
/// always reports the raw serialized size.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub key: String,
    pub kind: PayloadKind,
    pub blob: Vec<u8>,
    pub compressed: bool,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub dependencies: Vec<String>,
}

/// Durable backing tier behind the in-memory cache.
///
/// Implementations must provide atomic per-key writes; multi-key deletes
/// need not be globally atomic. Expired rows are never returned from
/// `get`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetches a live entry. Expired rows are treated as absent.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// Writes an entry and its dependency registrations atomically.
    async fn put(&self, entry: &StoredEntry) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes a batch of keys in one transaction, returning the number of
    /// rows removed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Returns every key whose dependency set contains `table`.
    async fn scan_by_dependency(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Best-effort hit-count bump for a durable-tier read.
    async fn touch_hit(&self, key: &str) -> Result<(), StoreError>;

    /// Live keys ordered by hit count, for warmup promotion.
    async fn top_hit_keys(&self, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Removes expired rows and orphaned dependency registrations.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// `SQLite`-backed durable store.
///
/// Writes are per-key transactions: the entry row and its dependency rows
/// commit together, so `scan_by_dependency` can never observe an entry
/// without its registrations.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the store at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or the
    /// schema cannot be applied.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Io)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Opens an in-memory store, for tests and ephemeral deployments.
    ///
    /// A single pooled connection keeps the in-memory database alive and
    /// shared across all calls.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on pool or schema failure.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Io)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                blob BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                dependencies TEXT NOT NULL DEFAULT '[]'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_dependencies (
                dep TEXT NOT NULL,
                key TEXT NOT NULL,
                PRIMARY KEY (dep, key)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_deps_dep ON cache_dependencies(dep)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEntry, StoreError> {
        let kind_str: String = row.try_get("kind")?;
        let kind = PayloadKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown payload kind: {kind_str}")))?;

        let deps_json: String = row.try_get("dependencies")?;
        let dependencies: Vec<String> = serde_json::from_str(&deps_json)
            .map_err(|e| StoreError::Corrupt(format!("bad dependency list: {e}")))?;

        let created_ms: i64 = row.try_get("created_at")?;
        let expires_ms: i64 = row.try_get("expires_at")?;
        let size_bytes: i64 = row.try_get("size_bytes")?;
        let hit_count: i64 = row.try_get("hit_count")?;

        Ok(StoredEntry {
            key: row.try_get("key")?,
            kind,
            blob: row.try_get("blob")?,
            compressed: row.try_get::<i64, _>("compressed")? != 0,
            size_bytes: usize::try_from(size_bytes).unwrap_or(0),
            created_at: timestamp_from_millis(created_ms),
            expires_at: timestamp_from_millis(expires_ms),
            hit_count: u64::try_from(hit_count).unwrap_or(0),
            dependencies,
        })
    }
}

fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let entry = Self::decode_row(&row)?;
        if entry.expires_at <= Utc::now() {
            // Opportunistic eviction; failure here is harmless.
            if let Err(e) = self.delete(key).await {
                debug!(key, error = %e, "failed to evict expired row");
            }
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn put(&self, entry: &StoredEntry) -> Result<(), StoreError> {
        let deps_json = serde_json::to_string(&entry.dependencies)
            .map_err(|e| StoreError::Corrupt(format!("unserializable dependency list: {e}")))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO cache_entries
                (key, kind, blob, compressed, size_bytes, created_at, expires_at, hit_count, dependencies)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.key)
        .bind(entry.kind.as_str())
        .bind(&entry.blob)
        .bind(i64::from(entry.compressed))
        .bind(i64::try_from(entry.size_bytes).unwrap_or(i64::MAX))
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .bind(i64::try_from(entry.hit_count).unwrap_or(i64::MAX))
        .bind(&deps_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM cache_dependencies WHERE key = ?")
            .bind(&entry.key)
            .execute(&mut *tx)
            .await?;

        for dep in &entry.dependencies {
            sqlx::query("INSERT OR IGNORE INTO cache_dependencies (dep, key) VALUES (?, ?)")
                .bind(dep)
                .bind(&entry.key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_dependencies WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for key in keys {
            let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
            sqlx::query("DELETE FROM cache_dependencies WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn scan_by_dependency(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT key FROM cache_dependencies WHERE dep = ?")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| row.try_get::<String, _>("key").map_err(StoreError::Io)).collect()
    }

    async fn touch_hit(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET hit_count = hit_count + 1 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn top_hit_keys(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT key FROM cache_entries WHERE expires_at > ? ORDER BY hit_count DESC LIMIT ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row.try_get::<String, _>("key").map_err(StoreError::Io)).collect()
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            warn!(purged, "purged expired cache rows");
            sqlx::query(
                "DELETE FROM cache_dependencies
                 WHERE key NOT IN (SELECT key FROM cache_entries)",
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(purged)
    }
}
