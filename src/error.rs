//! Error types for registry-dl
//!
//! This module provides the error taxonomy for the fetch engine:
//! - Per-item fetch failures (network, rate limit, not found, malformed body)
//! - Pool-level failures (no proxies available)
//! - Run-level failures (configuration, I/O)
//!
//! Per-item errors never abort a run; they degrade to a failed
//! [`FetchResult`](crate::types::FetchResult). Pool and configuration errors
//! surface to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for registry-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for registry-dl
///
/// Each variant includes enough context (URL, saved diagnostic path, status
/// code) to diagnose a failure without halting throughput.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "proxy.file")
        key: Option<String>,
    },

    /// Network-level error (timeout, connection refused, TLS failure)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Remote rate limiter rejected the request (HTTP 429)
    #[error("rate limited by remote API: {url}")]
    RateLimited {
        /// The URL that returned HTTP 429
        url: String,
    },

    /// Record does not exist on the remote API (HTTP 404) — terminal, not retried
    #[error("record not found: {url}")]
    NotFound {
        /// The URL that returned HTTP 404
        url: String,
    },

    /// HTTP 200 with a body that does not parse as JSON
    #[error("malformed response body from {url}")]
    MalformedResponse {
        /// The URL that returned the unparseable body
        url: String,
        /// Where the raw body was saved for inspection, if it was
        diagnostic: Option<PathBuf>,
    },

    /// Unexpected HTTP status (anything other than 200/404/429)
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// The HTTP status code returned
        status: u16,
        /// The URL that returned it
        url: String,
    },

    /// No proxy available: the pool is empty
    #[error("proxy pool exhausted: no proxies available")]
    PoolExhausted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Run was cancelled before this operation completed
    #[error("interrupted: run cancelled")]
    Interrupted,
}

impl Error {
    /// Coarse category of this error, for aggregate reporting
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_) | Error::UnexpectedStatus { .. } => ErrorCategory::Network,
            Error::RateLimited { .. } => ErrorCategory::RateLimited,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::MalformedResponse { .. } => ErrorCategory::MalformedResponse,
            Error::PoolExhausted => ErrorCategory::PoolExhausted,
            Error::Config { .. } => ErrorCategory::Config,
            Error::Io(_) | Error::Serialization(_) | Error::Interrupted => ErrorCategory::Other,
        }
    }

    /// True if this error stems from the remote rate limiter (HTTP 429)
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

/// Coarse error category used for aggregate error reporting
///
/// The final run summary shows counts per category, not an error-by-error
/// dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeout, connection failure, or unexpected HTTP status
    Network,
    /// HTTP 429 from the remote API
    RateLimited,
    /// HTTP 404 — record does not exist
    NotFound,
    /// HTTP 200 with an unparseable body
    MalformedResponse,
    /// No active proxy could be obtained
    PoolExhausted,
    /// Invalid or unreadable configuration
    Config,
    /// Anything else (I/O, serialization, cancellation)
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::MalformedResponse => "malformed_response",
            ErrorCategory::PoolExhausted => "pool_exhausted",
            ErrorCategory::Config => "config",
            ErrorCategory::Other => "other",
        };
        write!(f, "{name}")
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_categorized_and_flagged() {
        let err = Error::RateLimited {
            url: "https://api.example.com/records/1".into(),
        };
        assert_eq!(err.category(), ErrorCategory::RateLimited);
        assert!(err.is_rate_limit());
    }

    #[test]
    fn not_found_is_not_a_rate_limit() {
        let err = Error::NotFound {
            url: "https://api.example.com/records/2".into(),
        };
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn unexpected_status_counts_as_network() {
        let err = Error::UnexpectedStatus {
            status: 502,
            url: "https://api.example.com/records/3".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn config_error_displays_message() {
        let err = Error::Config {
            message: "proxy file is empty".into(),
            key: Some("proxy.file".into()),
        };
        assert_eq!(err.to_string(), "configuration error: proxy file is empty");
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn category_display_names_are_snake_case() {
        assert_eq!(
            ErrorCategory::MalformedResponse.to_string(),
            "malformed_response"
        );
        assert_eq!(ErrorCategory::PoolExhausted.to_string(), "pool_exhausted");
    }
}
