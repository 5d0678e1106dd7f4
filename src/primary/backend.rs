//! The batched key-value service behind the primary store.

use crate::types::{Chunk, ChunkKey};
use std::time::Duration;
use thiserror::Error;

/// Bytes an item costs beyond its partition key and payload
/// (attribute names, sort key, chunk count).
pub const ITEM_ATTRIBUTE_OVERHEAD: usize = 64;

/// Errors reported by a backend call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("request rejected: {0}")]
    Validation(String),
}

impl BackendError {
    /// Whether the call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Throttled(_) | BackendError::Unavailable(_) | BackendError::Timeout(_)
        )
    }
}

/// One item of a batch write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteRequest {
    Put(Chunk),
    Delete(ChunkKey),
}

impl WriteRequest {
    pub fn partition_key(&self) -> &str {
        match self {
            WriteRequest::Put(chunk) => &chunk.partition_key,
            WriteRequest::Delete(key) => &key.partition_key,
        }
    }
}

/// One page of a partition query.
#[derive(Clone, Debug, Default)]
pub struct QueryPage {
    /// Chunks in ascending sort key order.
    pub chunks: Vec<Chunk>,
    /// Sort key to continue after, if more chunks remain.
    pub last_evaluated: Option<u64>,
}

/// A remote partitioned key-value service addressed by
/// `(partition_key, sort_key)`.
///
/// Every call receives the timeout it must honor. Implementations report
/// throttling and connectivity problems as retryable errors; the primary
/// store owns the retry loop.
pub trait ChunkBackend: Send + Sync {
    /// Fail unless `table` exists with the expected key schema.
    fn check_table(&self, table: &str) -> Result<(), BackendError>;

    /// Read chunks of a partition in sort key order, starting after
    /// `start_after` when given.
    fn query(
        &self,
        partition_key: &str,
        start_after: Option<u64>,
        timeout: Duration,
    ) -> Result<QueryPage, BackendError>;

    /// List the sort keys stored under a partition.
    fn sort_keys(&self, partition_key: &str, timeout: Duration) -> Result<Vec<u64>, BackendError>;

    /// Apply a batch of puts and deletes, returning the requests that were
    /// not processed.
    fn batch_write(
        &self,
        requests: &[WriteRequest],
        timeout: Duration,
    ) -> Result<Vec<WriteRequest>, BackendError>;

    /// Release client resources.
    fn close(&self) {}
}

/// Size of a chunk as the backend accounts it.
pub fn item_size(chunk: &Chunk) -> usize {
    chunk.partition_key.len() + chunk.payload.len() + ITEM_ATTRIBUTE_OVERHEAD
}
