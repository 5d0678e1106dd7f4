//! Error types for the run-state store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Local mirror file failure.
    #[error("Mirror I/O error: {0}")]
    MirrorIo(#[from] std::io::Error),

    /// Throttling or a network blip; only seen inside the retry loop.
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Primary store unavailable during {operation} after {attempts} attempt(s): {reason}")]
    PrimaryUnavailable {
        operation: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("Corrupt partition set for {partition_key}: {reason}")]
    CorruptPartitionSet {
        partition_key: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The canonical key does not fit in a backend item next to a full chunk.
    #[error("Key of {len} bytes exceeds the {max}-byte limit: {key}")]
    KeyTooLong { key: String, len: usize, max: usize },

    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("Store is closed")]
    Closed,

    #[error("Mirror is locked by another process")]
    Locked,

    #[error("Invalid mirror format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl StoreError {
    /// Whether this error means the primary could not answer, so a read
    /// should be served from the mirror instead.
    pub fn is_primary_failure(&self) -> bool {
        matches!(
            self,
            StoreError::PrimaryUnavailable { .. }
                | StoreError::DeadlineExceeded(_)
                | StoreError::Transient(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Configuration(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
