//! Error types shared across the sync subsystem.
//!
//! Every failure here is caught at an operation boundary and turned into
//! either a silent retry (realtime channel, periodic refresh) or a
//! user-visible [`crate::notify::Notice`]. Nothing is allowed to bubble up
//! into the register UI as a panic.

use thiserror::Error;

/// Failures of the durable local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be opened at all (permissions, read-only media,
    /// corrupted file that survived the delete-and-retry). Offline buffering
    /// is disabled for the session.
    #[error("offline storage unavailable: {0}")]
    Unavailable(String),
    /// A single operation failed (disk full, busy timeout, schema mismatch).
    #[error("offline storage I/O error: {0}")]
    Io(String),
    /// One stored row can no longer be decoded. The rest of the store is
    /// usable.
    #[error("pending transaction {local_id} is unreadable: {detail}")]
    Corrupt { local_id: i64, detail: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Io(format!("payload encoding: {e}"))
    }
}

/// A single transaction could not be submitted to the backend.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("backend not configured")]
    NotConfigured,
    #[error("{0}")]
    Network(String),
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },
    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),
}

/// Realtime change channel failures. All of these feed the reconnect
/// backoff in [`crate::realtime::manager`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel connect failed: {0}")]
    Connect(String),
    #[error("channel stream error: {0}")]
    Stream(String),
    #[error("channel closed by server")]
    Closed,
    #[error("channel protocol error: {0}")]
    Protocol(String),
}

/// Offline queue failures reported to the caller of a sale.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("offline buffering is disabled for this session")]
    BufferingDisabled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sale could not be submitted or saved offline: {0}")]
    SaleLost(String),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} is not a usable URL: {value:?}")]
    InvalidUrl { var: &'static str, value: String },
}
