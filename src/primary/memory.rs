//! In-process chunk backend.
//!
//! Enforces the same per-item and per-batch limits as the managed service
//! and can inject the failures the primary store must survive: throttling,
//! outages, slow calls, partially processed batches, per-partition
//! rejections and silent data loss.

use super::backend::{
    item_size, BackendError, ChunkBackend, QueryPage, WriteRequest, ITEM_ATTRIBUTE_OVERHEAD,
};
use crate::types::Chunk;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Limits enforced by the backend.
#[derive(Clone, Copy, Debug)]
pub struct BackendLimits {
    pub max_item_bytes: usize,
    pub max_batch_write_items: usize,
    pub max_page_bytes: usize,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_item_bytes: 400 * 1024,
            max_batch_write_items: 25,
            max_page_bytes: 1024 * 1024,
        }
    }
}

/// Stored attributes of one item.
#[derive(Clone)]
struct StoredItem {
    chunk_count: u64,
    payload: Vec<u8>,
}

/// Pending injected faults.
#[derive(Default)]
struct Faults {
    /// Errors returned by the next calls, in order.
    next_errors: VecDeque<BackendError>,
    /// Partitions whose every call fails.
    partitions: HashMap<String, BackendError>,
    /// Batch writes that should process only part of their items.
    partial_batches: u32,
    /// Simulated latency per call.
    latency: Option<Duration>,
    /// Every call fails while set.
    outage: Option<BackendError>,
}

/// Call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub queries: u64,
    pub sort_key_listings: u64,
    pub batch_writes: u64,
}

/// An in-memory [`ChunkBackend`].
pub struct MemoryBackend {
    table: String,
    limits: BackendLimits,
    items: RwLock<BTreeMap<(String, u64), StoredItem>>,
    faults: Mutex<Faults>,
    closed: AtomicBool,
    queries: AtomicU64,
    sort_key_listings: AtomicU64,
    batch_writes: AtomicU64,
}

impl MemoryBackend {
    /// Create a backend serving `table` with default limits.
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_limits(table, BackendLimits::default())
    }

    pub fn with_limits(table: impl Into<String>, limits: BackendLimits) -> Self {
        Self {
            table: table.into(),
            limits,
            items: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            closed: AtomicBool::new(false),
            queries: AtomicU64::new(0),
            sort_key_listings: AtomicU64::new(0),
            batch_writes: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> BackendLimits {
        self.limits
    }

    // --- Fault injection ---

    /// Fail the next call with `error`. Queued errors are consumed in order.
    pub fn fail_next(&self, error: BackendError) {
        self.faults.lock().next_errors.push_back(error);
    }

    /// Fail every call touching `partition_key` with `error`.
    pub fn fail_partition(&self, partition_key: impl Into<String>, error: BackendError) {
        self.faults.lock().partitions.insert(partition_key.into(), error);
    }

    /// Stop failing calls for `partition_key`.
    pub fn heal_partition(&self, partition_key: &str) {
        self.faults.lock().partitions.remove(partition_key);
    }

    /// Process only the first half of each of the next `count` batch writes.
    pub fn leave_unprocessed(&self, count: u32) {
        self.faults.lock().partial_batches = count;
    }

    /// Fail every call with `error` until [`MemoryBackend::end_outage`].
    pub fn begin_outage(&self, error: BackendError) {
        self.faults.lock().outage = Some(error);
    }

    pub fn end_outage(&self) {
        self.faults.lock().outage = None;
    }

    /// Delay every call. Calls whose latency exceeds their timeout fail with
    /// [`BackendError::Timeout`].
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    // --- Direct data access ---

    /// Drop every item of a partition without going through the API.
    pub fn lose_partition(&self, partition_key: &str) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|(pk, _), _| pk != partition_key);
        before - items.len()
    }

    /// Store a chunk without going through the API.
    pub fn insert_raw(&self, chunk: Chunk) {
        self.items.write().insert(
            (chunk.partition_key, chunk.sort_key),
            StoredItem {
                chunk_count: chunk.chunk_count,
                payload: chunk.payload,
            },
        );
    }

    /// Remove one chunk without going through the API.
    pub fn remove_raw(&self, partition_key: &str, sort_key: u64) -> bool {
        self.items
            .write()
            .remove(&(partition_key.to_string(), sort_key))
            .is_some()
    }

    /// Total number of stored items.
    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            queries: self.queries.load(Ordering::Relaxed),
            sort_key_listings: self.sort_key_listings.load(Ordering::Relaxed),
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Apply injected faults for a call touching `partitions`.
    fn admit<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a str>,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::Validation("client closed".into()));
        }

        let latency = {
            let mut faults = self.faults.lock();
            if let Some(error) = faults.outage.clone() {
                return Err(error);
            }
            if let Some(error) = faults.next_errors.pop_front() {
                return Err(error);
            }
            for pk in partitions {
                if let Some(error) = faults.partitions.get(pk) {
                    return Err(error.clone());
                }
            }
            faults.latency
        };

        if let Some(latency) = latency {
            if latency > timeout {
                std::thread::sleep(timeout);
                return Err(BackendError::Timeout(timeout));
            }
            std::thread::sleep(latency);
        }

        Ok(())
    }

    fn validate_request(&self, request: &WriteRequest) -> Result<(), BackendError> {
        if let WriteRequest::Put(chunk) = request {
            let size = item_size(chunk);
            if size > self.limits.max_item_bytes {
                return Err(BackendError::Validation(format!(
                    "item size {} exceeds limit {}",
                    size, self.limits.max_item_bytes
                )));
            }
        }
        Ok(())
    }
}

impl ChunkBackend for MemoryBackend {
    fn check_table(&self, table: &str) -> Result<(), BackendError> {
        self.admit(std::iter::empty(), Duration::MAX)?;
        if table == self.table {
            Ok(())
        } else {
            Err(BackendError::TableNotFound(table.to_string()))
        }
    }

    fn query(
        &self,
        partition_key: &str,
        start_after: Option<u64>,
        timeout: Duration,
    ) -> Result<QueryPage, BackendError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.admit([partition_key], timeout)?;

        let start = start_after.map_or(0, |s| s.saturating_add(1));
        let items = self.items.read();
        let range = (partition_key.to_string(), start)..=(partition_key.to_string(), u64::MAX);

        let mut page = QueryPage::default();
        let mut page_bytes = 0usize;
        let mut iter = items.range(range).peekable();

        while let Some(((pk, sort_key), item)) = iter.next() {
            page_bytes += pk.len() + item.payload.len() + ITEM_ATTRIBUTE_OVERHEAD;
            page.chunks.push(Chunk {
                partition_key: pk.clone(),
                sort_key: *sort_key,
                chunk_count: item.chunk_count,
                payload: item.payload.clone(),
            });
            if page_bytes >= self.limits.max_page_bytes && iter.peek().is_some() {
                page.last_evaluated = Some(*sort_key);
                break;
            }
        }

        Ok(page)
    }

    fn sort_keys(&self, partition_key: &str, timeout: Duration) -> Result<Vec<u64>, BackendError> {
        self.sort_key_listings.fetch_add(1, Ordering::Relaxed);
        self.admit([partition_key], timeout)?;

        let items = self.items.read();
        let range = (partition_key.to_string(), 0)..=(partition_key.to_string(), u64::MAX);
        Ok(items.range(range).map(|((_, sort_key), _)| *sort_key).collect())
    }

    fn batch_write(
        &self,
        requests: &[WriteRequest],
        timeout: Duration,
    ) -> Result<Vec<WriteRequest>, BackendError> {
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
        self.admit(requests.iter().map(|r| r.partition_key()), timeout)?;

        if requests.len() > self.limits.max_batch_write_items {
            return Err(BackendError::Validation(format!(
                "batch of {} items exceeds limit {}",
                requests.len(),
                self.limits.max_batch_write_items
            )));
        }
        // The whole batch is rejected if any item is invalid.
        for request in requests {
            self.validate_request(request)?;
        }

        let processed = {
            let mut faults = self.faults.lock();
            if faults.partial_batches > 0 {
                faults.partial_batches -= 1;
                requests.len() / 2
            } else {
                requests.len()
            }
        };

        let mut items = self.items.write();
        for request in &requests[..processed] {
            match request {
                WriteRequest::Put(chunk) => {
                    items.insert(
                        (chunk.partition_key.clone(), chunk.sort_key),
                        StoredItem {
                            chunk_count: chunk.chunk_count,
                            payload: chunk.payload.clone(),
                        },
                    );
                }
                WriteRequest::Delete(key) => {
                    items.remove(&(key.partition_key.clone(), key.sort_key));
                }
            }
        }

        Ok(requests[processed..].to_vec())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
