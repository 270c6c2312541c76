//! Error types for adaptcrawl.
//!
//! Library crates use [`AdaptError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all adaptcrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum AdaptError {
    /// Network failure or timeout-class HTTP status; safe to retry.
    #[error("transient fetch error for {url}: {message}")]
    TransientFetch { url: String, message: String },

    /// Fetch failure that will not improve on retry (404, blocked, bad scheme).
    #[error("permanent fetch error for {url} (status {status:?}): {message}")]
    PermanentFetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// A single item or page could not be turned into a record.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The semantic extraction backend failed or returned garbage.
    #[error("extraction backend error: {0}")]
    ExtractionBackend(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The job or batch was cancelled before this unit of work ran.
    #[error("cancelled")]
    Cancelled,

    /// A spawned worker task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AdaptError>;

/// Serializable classification of an [`AdaptError`], kept in job error lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientFetch,
    PermanentFetch,
    Parse,
    ExtractionBackend,
    Config,
    Timeout,
    Storage,
    Io,
    Validation,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransientFetch => "transient_fetch",
            Self::PermanentFetch => "permanent_fetch",
            Self::Parse => "parse",
            Self::ExtractionBackend => "extraction_backend",
            Self::Config => "config",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Io => "io",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl AdaptError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a transient (retryable) fetch error.
    pub fn transient(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientFetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a permanent (non-retryable) fetch error.
    pub fn permanent(url: impl Into<String>, status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::PermanentFetch {
            url: url.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only network-class fetch failures and timeouts qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. } | Self::Timeout { .. })
    }

    /// Classification used when the error is recorded on a job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientFetch { .. } => ErrorKind::TransientFetch,
            Self::PermanentFetch { .. } => ErrorKind::PermanentFetch,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::ExtractionBackend(_) => ErrorKind::ExtractionBackend,
            Self::Config { .. } => ErrorKind::Config,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Io { .. } => ErrorKind::Io,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = AdaptError::config("no urls given");
        assert_eq!(err.to_string(), "config error: no urls given");

        let err = AdaptError::permanent("https://example.com/x", Some(404), "not found");
        assert!(err.to_string().contains("status Some(404)"));
    }

    #[test]
    fn transient_classification() {
        assert!(AdaptError::transient("https://a", "connection reset").is_transient());
        assert!(AdaptError::timeout("fetch", std::time::Duration::from_secs(1)).is_transient());
        assert!(!AdaptError::permanent("https://a", Some(404), "gone").is_transient());
        assert!(!AdaptError::parse("bad item").is_transient());
        assert!(!AdaptError::ExtractionBackend("down".into()).is_transient());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let kind = AdaptError::ExtractionBackend("x".into()).kind();
        let json = serde_json::to_string(&kind).expect("serialize");
        assert_eq!(json, "\"extraction_backend\"");
        assert_eq!(kind.to_string(), "extraction_backend");
    }
}
