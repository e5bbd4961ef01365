//! Common error types for catalogsync.

use thiserror::Error;

/// Top-level error type for catalogsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The relational source could not be queried.
    #[error("Source error: {0}")]
    Source(String),

    /// The source lacks a capability the requested operation depends on.
    #[error("Capability missing: {0}")]
    Capability(String),

    /// Transport-level failure talking to a remote API.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote API answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Sync bookkeeping (state file, identity map) could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation or record shape is not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    ///
    /// Only transport failures and throttling/gateway statuses qualify; a
    /// rejected payload will be rejected again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-record outcome of a failed sync step.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Aborts the run.
    #[error(transparent)]
    Fatal(#[from] Error),

    /// Skips a single record.
    #[error("record {record_id} skipped: {reason}")]
    Recoverable { record_id: String, reason: String },

    /// Completes, but flags the record for manual reconciliation.
    #[error("record {record_id} inconsistent: {reason}")]
    Degraded { record_id: String, reason: String },
}

impl SyncError {
    /// Build a recoverable error for `record_id`.
    pub fn recoverable(record_id: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::Recoverable {
            record_id: record_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a degraded error for `record_id`.
    pub fn degraded(record_id: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::Degraded {
            record_id: record_id.into(),
            reason: reason.to_string(),
        }
    }
}
