//! Application error types for member-sync
//!
//! This module defines the error types shared by the ledger, the upstream
//! client and the synchronization engine. All error types use `thiserror`.

use std::time::Duration;

use thiserror::Error;

/// Upstream error code for "too many requests per second"
pub const RATE_LIMIT_CODE: i64 = 6;

/// Upstream error code for "access denied due to privacy settings"
pub const ACCESS_DENIED_CODE: i64 = 260;

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error raised by the async connection wrapper
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Errors reported by the upstream API
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    /// Quota exceeded; `retry_after` is the wait the upstream asked for, if any
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// The target resource is hidden by its owner's privacy settings
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Any other API error code
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response body did not match the expected shape
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// Non-success HTTP status
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),
}

impl UpstreamError {
    /// Classify an API error object by its numeric code
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            RATE_LIMIT_CODE => UpstreamError::RateLimited { retry_after: None },
            ACCESS_DENIED_CODE => UpstreamError::AccessDenied(message),
            _ => UpstreamError::Api { code, message },
        }
    }
}

/// Error produced by a single synchronization job
///
/// Its `Display` output is what ends up in the failed job's `info.error`.
#[derive(Debug, Error)]
pub enum JobError {
    /// Upstream request failed with a fatal error
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Ledger or membership store failed
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Family an error belongs to for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Waiting is expected to clear the error
    Transient,
    /// Retrying cannot help
    Fatal,
}

/// Trait for errors the retry engine can classify
pub trait RetryableError {
    /// Family of this error
    fn kind(&self) -> ErrorKind;

    /// Wait requested by the upstream before the next attempt, if it said so
    fn retry_after(&self) -> Option<Duration>;
}

impl RetryableError for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::RateLimited { .. } => ErrorKind::Transient,
            UpstreamError::AccessDenied(_)
            | UpstreamError::Api { .. }
            | UpstreamError::InvalidData(_)
            | UpstreamError::Unauthorized
            | UpstreamError::ServerError(_)
            | UpstreamError::NetworkTimeout
            | UpstreamError::Network(_) => ErrorKind::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
