//! Error types for calmirror
//!
//! Defines the error enum covering every failure mode of the mirror: provider
//! responses that the sync engine recovers from locally (not found, invalidated
//! tokens), failures that are logged and skipped (invalid resources), transient
//! failures the hosting layer may retry, and fatal configuration errors.
//! Uses thiserror for ergonomic error handling.

use crate::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for calmirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Comprehensive error type for calmirror operations
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Configuration errors (missing calendar ids, bad time window, unreadable config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The provider rejected a sync or page token (HTTP 410); a full sync is required
    #[error("Sync token invalidated: {0}")]
    TokenInvalid(String),

    /// The requested resource does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider rejected a write because the resource id is malformed
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// An outbound call did not complete before its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Any other non-success provider response
    #[error("Provider error (HTTP {status}): {message}")]
    Provider { status: u16, message: String },

    /// The trigger lock could not be acquired within its bounded wait
    #[error("Lock not acquired: {0}")]
    LockTimeout(String),

    /// Storage errors that are not raised by SQLite itself
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Build a provider error from an HTTP status and response body
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        MirrorError::Provider {
            status,
            message: message.into(),
        }
    }

    /// True when the provider reported the sync cursor as expired or out of range
    pub fn is_token_invalid(&self) -> bool {
        matches!(self, MirrorError::TokenInvalid(_))
    }

    /// True for "resource does not exist" responses
    pub fn is_not_found(&self) -> bool {
        matches!(self, MirrorError::NotFound(_))
    }

    /// True when a write payload was rejected as malformed
    pub fn is_invalid_resource(&self) -> bool {
        matches!(self, MirrorError::InvalidResource(_))
    }

    /// True for failures that may succeed if the caller tries again later
    pub fn is_transient(&self) -> bool {
        !matches!(self.retry_decision(), RetryDecision::NoRetry)
    }

    /// Short, stable label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorError::Config(_) => "config",
            MirrorError::TokenInvalid(_) => "token_invalid",
            MirrorError::NotFound(_) => "not_found",
            MirrorError::InvalidResource(_) => "invalid_resource",
            MirrorError::Timeout { .. } => "timeout",
            MirrorError::RateLimited(_) => "rate_limited",
            MirrorError::Provider { .. } => "provider",
            MirrorError::LockTimeout(_) => "lock_timeout",
            MirrorError::Storage(_) | MirrorError::Database(_) => "storage",
            MirrorError::Io(_) => "io",
            MirrorError::Json(_) | MirrorError::Yaml(_) => "parse",
            MirrorError::Http(_) => "http",
            MirrorError::Other(_) => "other",
        }
    }
}

impl RetryableError for MirrorError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            // Retryable errors
            MirrorError::Timeout { .. } => RetryDecision::Retry,
            MirrorError::LockTimeout(_) => RetryDecision::Retry,
            MirrorError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            MirrorError::Provider { status, .. } => match status {
                429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                500..=599 => RetryDecision::Retry,
                _ => RetryDecision::NoRetry,
            },
            MirrorError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            // Non-retryable errors
            MirrorError::Config(_) => RetryDecision::NoRetry,
            MirrorError::TokenInvalid(_) => RetryDecision::NoRetry,
            MirrorError::NotFound(_) => RetryDecision::NoRetry,
            MirrorError::InvalidResource(_) => RetryDecision::NoRetry,
            MirrorError::Storage(_) => RetryDecision::NoRetry,
            MirrorError::Io(_) => RetryDecision::NoRetry,
            MirrorError::Json(_) => RetryDecision::NoRetry,
            MirrorError::Yaml(_) => RetryDecision::NoRetry,
            MirrorError::Database(_) => RetryDecision::NoRetry,
            MirrorError::Other(_) => RetryDecision::NoRetry,
        }
    }
}

/// Extract retry-after seconds from a provider message
///
/// Matches patterns like "retry after 60 seconds" or "Retry-After: 60".
pub(crate) fn extract_retry_after(msg: &str) -> Option<u64> {
    let msg_lower = msg.to_lowercase();
    let pos = msg_lower
        .find("retry after")
        .map(|p| p + "retry after".len())
        .or_else(|| msg_lower.find("retry-after").map(|p| p + "retry-after".len()))?;

    let num_str: String = msg_lower[pos..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    num_str.parse().ok()
}
