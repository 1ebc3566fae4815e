//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the `Default` implementations
//! 2. **Config file**: TOML file specified by `DOTFLOW_CONFIG`
//! 3. **Environment variables**: `DOTFLOW__*` vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`IndexerSettings`]: upstream indexer endpoint, API key, timeouts
//! - [`CacheSettings`]: tier sizing, TTLs, compression, invalidation
//! - [`FetchSettings`]: page sizes and caps for incremental sync
//! - [`BatchSettings`]: batch fan-out sizing and pacing
//! - [`LoggingConfig`]: log level and format
//!
//! # Validation
//!
//! Configuration is validated at load time. Invalid configurations (zero
//! cache sizes, unparseable URLs, an L2 TTL below the L1 TTL) return
//! errors rather than failing silently later.
//!
//! # Example
//!
//! ```toml
//! [indexer]
//! base_url = "https://indexer.example.com"
//! api_key = "..."
//! timeout_seconds = 15
//!
//! [cache]
//! database_url = "sqlite://dotflow-cache.db"
//! l1_capacity = 1000
//! l1_ttl_seconds = 300
//!
//! [batch]
//! batch_size = 20
//! max_concurrent = 5
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use url::Url;

use crate::{
    cache::TieredCacheConfig,
    fetch::{BatchOptions, FetchOptions, FetcherConfig},
    upstream::IndexerClientConfig,
};

/// Upstream indexer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerSettings {
    /// Base URL of the indexing API. Must be `http` or `https`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent with every request. Optional for self-hosted indexers.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds. Defaults to `15`.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Maximum concurrent in-flight requests. Defaults to `50`.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,

    /// Permit acquisition timeout in milliseconds. Defaults to `500`.
    #[serde(default = "default_permit_timeout_ms")]
    pub permit_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://indexer.example.com".to_string()
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_concurrent_limit() -> usize {
    50
}

fn default_permit_timeout_ms() -> u64 {
    500
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_seconds: default_timeout_seconds(),
            concurrent_limit: default_concurrent_limit(),
            permit_timeout_ms: default_permit_timeout_ms(),
        }
    }
}

impl IndexerSettings {
    #[must_use]
    pub fn client_config(&self) -> IndexerClientConfig {
        IndexerClientConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            request_timeout: Duration::from_secs(self.timeout_seconds),
            concurrent_limit: self.concurrent_limit,
            permit_timeout_ms: self.permit_timeout_ms,
        }
    }
}

/// Cache tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// `SQLite` URL backing the durable tier. Defaults to a local file.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Entries resident in the in-memory tier. Defaults to `1000`.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// In-memory entry lifetime in seconds. Defaults to `300`.
    #[serde(default = "default_l1_ttl_seconds")]
    pub l1_ttl_seconds: u64,

    /// Default durable entry lifetime in seconds. Must be at least
    /// `l1_ttl_seconds`. Defaults to `3600`.
    #[serde(default = "default_default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Raw payload size in bytes above which durable rows are compressed.
    /// Defaults to `1024`.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// Keys deleted per invalidation batch. Defaults to `50`.
    #[serde(default = "default_invalidation_batch_size")]
    pub invalidation_batch_size: usize,
}

fn default_database_url() -> String {
    "sqlite://dotflow-cache.db".to_string()
}

fn default_l1_capacity() -> usize {
    1000
}

fn default_l1_ttl_seconds() -> u64 {
    300
}

fn default_default_ttl_seconds() -> u64 {
    3600
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_invalidation_batch_size() -> usize {
    50
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            l1_capacity: default_l1_capacity(),
            l1_ttl_seconds: default_l1_ttl_seconds(),
            default_ttl_seconds: default_default_ttl_seconds(),
            compression_threshold_bytes: default_compression_threshold(),
            invalidation_batch_size: default_invalidation_batch_size(),
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn tiered_config(&self) -> TieredCacheConfig {
        TieredCacheConfig {
            l1_capacity: self.l1_capacity,
            l1_ttl: Duration::from_secs(self.l1_ttl_seconds),
            default_ttl: Duration::from_secs(self.default_ttl_seconds),
            compression_threshold: self.compression_threshold_bytes,
            invalidation_batch_size: self.invalidation_batch_size,
        }
    }
}

/// Incremental fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Records per upstream page. Defaults to `100`.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Page cap for one delta fetch. Defaults to `5`.
    #[serde(default = "default_max_delta_pages")]
    pub max_delta_pages: usize,

    /// Page cap for a full fetch. Defaults to `10`.
    #[serde(default = "default_max_full_pages")]
    pub max_full_pages: usize,

    /// Durable lifetime of record-set snapshots in seconds. Defaults to
    /// `3600`.
    #[serde(default = "default_snapshot_ttl_seconds")]
    pub snapshot_ttl_seconds: u64,
}

fn default_page_size() -> usize {
    100
}

fn default_max_delta_pages() -> usize {
    5
}

fn default_max_full_pages() -> usize {
    10
}

fn default_snapshot_ttl_seconds() -> u64 {
    3600
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_delta_pages: default_max_delta_pages(),
            max_full_pages: default_max_full_pages(),
            snapshot_ttl_seconds: default_snapshot_ttl_seconds(),
        }
    }
}

impl FetchSettings {
    #[must_use]
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            page_size: self.page_size,
            max_delta_pages: self.max_delta_pages,
            max_full_pages: self.max_full_pages,
            snapshot_ttl: Duration::from_secs(self.snapshot_ttl_seconds),
        }
    }
}

/// Batch fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Keys per chunk. Defaults to `20`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent fetches within a chunk. Defaults to `5`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Pause between chunks in milliseconds. Defaults to `200`.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

fn default_batch_size() -> usize {
    20
}

fn default_max_concurrent() -> usize {
    5
}

fn default_chunk_delay_ms() -> u64 {
    200
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl BatchSettings {
    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            fetch: FetchOptions::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridable via `RUST_LOG`). Defaults to
    /// `info`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `text` or `json`. Defaults to `text`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from defaults, the `DOTFLOW_CONFIG` file, and
    /// `DOTFLOW__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable sources, undeserializable
    /// values, or validation failures.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Ok(path) = std::env::var("DOTFLOW_CONFIG") {
            builder = builder.add_source(File::from(Path::new(&path)));
        }

        builder = builder.add_source(
            Environment::with_prefix("DOTFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.indexer.base_url)
            .map_err(|e| ConfigError::Message(format!("indexer.base_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Message(format!(
                "indexer.base_url must be http(s), got {}",
                url.scheme()
            )));
        }

        if self.cache.l1_capacity == 0 {
            return Err(ConfigError::Message("cache.l1_capacity must be non-zero".to_string()));
        }
        if self.cache.invalidation_batch_size == 0 {
            return Err(ConfigError::Message(
                "cache.invalidation_batch_size must be non-zero".to_string(),
            ));
        }
        if self.cache.default_ttl_seconds < self.cache.l1_ttl_seconds {
            return Err(ConfigError::Message(
                "cache.default_ttl_seconds must be at least cache.l1_ttl_seconds".to_string(),
            ));
        }

        if self.fetch.page_size == 0 {
            return Err(ConfigError::Message("fetch.page_size must be non-zero".to_string()));
        }
        if self.fetch.max_delta_pages == 0 || self.fetch.max_full_pages == 0 {
            return Err(ConfigError::Message("fetch page caps must be non-zero".to_string()));
        }

        if self.batch.batch_size == 0 || self.batch.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "batch.batch_size and batch.max_concurrent must be non-zero".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Message(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }
}

/// Initializes the global tracing subscriber from logging config.
///
/// `RUST_LOG` overrides the configured level. Repeated calls are no-ops,
/// which keeps tests that share a process safe.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}
