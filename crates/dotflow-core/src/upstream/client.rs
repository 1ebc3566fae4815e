use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::{trace, warn};
use url::Url;

use crate::{
    types::{Cursor, RecordKind, TransferRecord},
    upstream::IndexerError,
};

/// Source of record pages, as the fetcher consumes it.
///
/// [`IndexerClient`] is the production implementation; the trait seam
/// enables mock sources in tests, mirroring the repository abstraction
/// used for the durable store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetches one page of records for `key`.
    ///
    /// `after` is the exclusive recency boundary (only records strictly
    /// newer are returned); `resume` continues pagination within one
    /// logical fetch.
    ///
    /// # Errors
    ///
    /// Classified per [`IndexerError`].
    async fn fetch_page(
        &self,
        key: &str,
        kind: RecordKind,
        after: Option<Cursor>,
        resume: Option<Cursor>,
        limit: usize,
    ) -> Result<FetchPage, IndexerError>;
}

/// Configuration for the indexer HTTP client.
#[derive(Debug, Clone)]
pub struct IndexerClientConfig {
    /// Base URL of the indexing API (e.g. `https://indexer.example.com`).
    pub base_url: String,
    /// API key sent in the `X-API-Key` header. Optional for self-hosted
    /// indexers.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Maximum concurrent in-flight requests from this process.
    pub concurrent_limit: usize,
    /// Permit acquisition timeout in milliseconds.
    pub permit_timeout_ms: u64,
}

impl Default for IndexerClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://indexer.example.com".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(15),
            concurrent_limit: 50,
            permit_timeout_ms: 500,
        }
    }
}

/// One page of records returned by the indexer.
#[derive(Debug, Clone)]
pub struct FetchPage {
    /// Records in the upstream's native ordering (newest first).
    pub records: Vec<TransferRecord>,
    /// Resume token for the next page, absent on the last page.
    pub next_cursor: Option<Cursor>,
    /// Total records matching the query, as reported by the indexer.
    pub total_count: u64,
}

/// Response envelope wrapping every indexer payload.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PageData>,
}

#[derive(Debug, Deserialize)]
struct PageData {
    #[serde(default)]
    records: Vec<TransferRecord>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    total: u64,
}

/// Client for the rate-limited blockchain-indexing API.
///
/// Executes exactly one logical request per call and classifies failures;
/// it holds no caching or watermark logic. In-process concurrency is
/// bounded by a semaphore so a large batch cannot stampede the upstream
/// past its own `max_concurrent` budget.
pub struct IndexerClient {
    http: Client,
    permits: Arc<Semaphore>,
    config: IndexerClientConfig,
}

impl IndexerClient {
    /// Creates a client, validating the base URL eagerly.
    ///
    /// # Errors
    ///
    /// Returns `IndexerError::InvalidResponse` for an unparseable base URL
    /// and `IndexerError::Network` if the underlying HTTP client fails to
    /// build.
    pub fn new(config: IndexerClientConfig) -> Result<Self, IndexerError> {
        Url::parse(&config.base_url)
            .map_err(|e| IndexerError::InvalidResponse(format!("invalid base_url: {e}")))?;

        let http = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("dotflow-core/0.3")
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                warn!(error = %e, "failed to build http client");
                IndexerError::Network(format!("http client build failed: {e}"))
            })?;

        let permits = Arc::new(Semaphore::new(config.concurrent_limit));
        Ok(Self { http, permits, config })
    }

    /// Fetches one page of records for `key`.
    ///
    /// `after` is the exclusive recency boundary: the indexer returns only
    /// records strictly newer than it. `resume` continues pagination within
    /// one logical fetch. Both are rendered as opaque cursor tokens.
    ///
    /// # Errors
    ///
    /// Classified per the taxonomy in [`IndexerError`]. Transient server
    /// and transport failures are retried twice with exponential backoff;
    /// rate limits and cursor rejections are surfaced immediately.
    pub async fn fetch_page(
        &self,
        key: &str,
        kind: RecordKind,
        after: Option<Cursor>,
        resume: Option<Cursor>,
        limit: usize,
    ) -> Result<FetchPage, IndexerError> {
        const MAX_RETRIES: u32 = 2;

        let _permit = tokio::time::timeout(
            Duration::from_millis(self.config.permit_timeout_ms),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            warn!(key, available_permits = self.permits.available_permits(), "permit timeout");
            IndexerError::Timeout
        })?
        .map_err(|_| IndexerError::ConcurrencyLimit)?;

        let url = format!("{}/api/scan/{}", self.config.base_url.trim_end_matches('/'), kind.endpoint());
        let mut body = json!({ "address": key, "row": limit });
        if let Some(after) = after {
            body["after"] = json!(after.token());
        }
        if let Some(resume) = resume {
            body["page"] = json!(resume.token());
        }

        let mut retries = 0;
        loop {
            let mut request = self.http.post(&url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                request = request.header("X-API-Key", api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 {
                        trace!(key, kind = kind.as_str(), "indexer rate limited");
                        return Err(IndexerError::RateLimited);
                    }
                    if status.is_server_error() {
                        if retries < MAX_RETRIES {
                            retries += 1;
                            tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                            continue;
                        }
                        return Err(IndexerError::ServerError(format!("HTTP {}", status.as_u16())));
                    }
                    if !status.is_success() {
                        return Err(IndexerError::InvalidResponse(format!(
                            "HTTP {}",
                            status.as_u16()
                        )));
                    }

                    let envelope: Envelope = response.json().await.map_err(|e| {
                        IndexerError::InvalidResponse(Self::sanitize_network_error(&e))
                    })?;
                    return Self::unwrap_envelope(envelope);
                }
                Err(e) if e.is_timeout() => {
                    trace!(key, kind = kind.as_str(), "indexer request timeout");
                    return Err(IndexerError::Timeout);
                }
                Err(_) if retries < MAX_RETRIES => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                }
                Err(e) => {
                    return Err(IndexerError::Network(Self::sanitize_network_error(&e)));
                }
            }
        }
    }

    fn unwrap_envelope(envelope: Envelope) -> Result<FetchPage, IndexerError> {
        if envelope.code != 0 {
            return Err(IndexerError::from_envelope(envelope.code, &envelope.message));
        }
        let data = envelope
            .data
            .ok_or_else(|| IndexerError::InvalidResponse("missing data in envelope".to_string()))?;

        let next_cursor = match data.next_cursor.as_deref() {
            None | Some("") => None,
            Some(token) => Some(Cursor::parse(token).ok_or_else(|| {
                IndexerError::InvalidResponse(format!("unparseable next_cursor: {token}"))
            })?),
        };

        Ok(FetchPage { records: data.records, next_cursor, total_count: data.total })
    }

    /// Sanitizes transport errors so logs never leak endpoint internals.
    pub(crate) fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else {
            "network error".to_string()
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl RecordSource for IndexerClient {
    async fn fetch_page(
        &self,
        key: &str,
        kind: RecordKind,
        after: Option<Cursor>,
        resume: Option<Cursor>,
        limit: usize,
    ) -> Result<FetchPage, IndexerError> {
        IndexerClient::fetch_page(self, key, kind, after, resume, limit).await
    }
}
