//! Primary store: chunked values in a remote partitioned key-value service.
//!
//! The service is reached through the [`ChunkBackend`] trait. Items are
//! addressed by `(partition_key, sort_key)` and limited in size, so values are
//! split by the [`Partitioner`](crate::partition::Partitioner) before writing.

mod backend;
mod memory;
mod retry;
mod store;

pub use backend::{
    item_size, BackendError, ChunkBackend, QueryPage, WriteRequest, ITEM_ATTRIBUTE_OVERHEAD,
};
pub use memory::{BackendLimits, BackendStats, MemoryBackend};
pub use retry::{with_retry, Deadline, RetryPolicy};
pub use store::PrimaryStore;
