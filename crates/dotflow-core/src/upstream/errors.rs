use thiserror::Error;

/// Classification of indexer API status codes for intelligent handling.
///
/// The indexer wraps every response in an envelope with a numeric `code`.
/// Different categories require different handling strategies:
/// - Rate limits trigger backoff in the batch coordinator, never retries
///   inside a single fetch
/// - Cursor rejections trigger a full refetch rather than a generic failure
/// - Server-side errors are transient and may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCategory {
    /// Request was malformed or referenced an unknown address. Not retryable.
    ClientError,
    /// Indexer-side failure. Transient, safe to retry.
    ServerError,
    /// API quota exhausted for this key/window.
    RateLimit,
    /// The supplied pagination cursor is no longer valid (pruned history or
    /// index reorganization).
    CursorRejected,
}

impl ApiErrorCategory {
    /// Classifies an indexer envelope code and message into a category.
    ///
    /// Known codes:
    /// - `10001`: invalid parameter
    /// - `10004`: record not found (treated as client error)
    /// - `20008`: API rate limit exceeded
    /// - `20014`: invalid or expired cursor
    ///
    /// The cursor-rejection code is not emitted by every deployment, so the
    /// message is also inspected for cursor-related phrasing.
    #[must_use]
    pub fn from_code_and_message(code: i64, message: &str) -> Self {
        match code {
            10001 | 10004 => Self::ClientError,
            20008 => Self::RateLimit,
            20014 => Self::CursorRejected,
            _ => {
                let message_lower = message.to_lowercase();
                if message_lower.contains("cursor") || message_lower.contains("after param") {
                    Self::CursorRejected
                } else if message_lower.contains("rate limit")
                    || message_lower.contains("too many requests")
                {
                    Self::RateLimit
                } else {
                    Self::ServerError
                }
            }
        }
    }

    /// Returns `true` if a request failing with this category may succeed
    /// on retry without changing the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServerError)
    }

    /// Static string for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::RateLimit => "rate_limit",
            Self::CursorRejected => "cursor_rejected",
        }
    }
}

/// Errors from a single logical request against the indexing API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IndexerError {
    /// The upstream refused the request due to rate limiting (HTTP 429 or
    /// an envelope rate-limit code). Surfaced to the batch coordinator for
    /// backoff; never auto-retried inside the fetcher.
    #[error("Rate limited by indexer")]
    RateLimited,

    /// Request exceeded the configured timeout.
    #[error("Request timeout")]
    Timeout,

    /// The stored pagination cursor was rejected as invalid. Triggers a
    /// forced full refetch instead of a generic failure.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// HTTP 5xx or indexer-side envelope error.
    #[error("Indexer server error: {0}")]
    ServerError(String),

    /// Transport-level failure from the underlying HTTP client.
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be parsed or violated the envelope contract.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// In-process concurrency permit could not be acquired.
    #[error("Concurrency limit reached")]
    ConcurrencyLimit,
}

impl IndexerError {
    /// Builds the error for an envelope-level failure, classifying the code.
    #[must_use]
    pub fn from_envelope(code: i64, message: &str) -> Self {
        match ApiErrorCategory::from_code_and_message(code, message) {
            ApiErrorCategory::RateLimit => Self::RateLimited,
            ApiErrorCategory::CursorRejected => Self::InvalidCursor(message.to_string()),
            ApiErrorCategory::ClientError => {
                Self::InvalidResponse(format!("indexer rejected request ({code}): {message}"))
            }
            ApiErrorCategory::ServerError => {
                Self::ServerError(format!("indexer error ({code}): {message}"))
            }
        }
    }

    /// Returns `true` if the same request may be retried after a short
    /// backoff. Rate limits are deliberately excluded: the caller decides
    /// when the budget allows another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ServerError(_) | Self::Network(_))
    }

    /// Returns `true` for the distinct cursor-rejection class that must
    /// reset the watermark and fall back to a full refetch.
    #[must_use]
    pub fn is_cursor_rejection(&self) -> bool {
        matches!(self, Self::InvalidCursor(_))
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }

    /// Static string for log fields and per-key result reporting.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidCursor(_) => "invalid_cursor",
            Self::ServerError(_) => "server_error",
            Self::Network(_) => "network",
            Self::InvalidResponse(_) => "invalid_response",
            Self::ConcurrencyLimit => "concurrency_limit",
        }
    }
}
