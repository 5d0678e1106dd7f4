//! Chunked values on top of a [`ChunkBackend`].

use super::backend::{ChunkBackend, WriteRequest};
use super::retry::{with_retry, Deadline, RetryPolicy};
use crate::config::{StateStoreConfig, KEY_HEADROOM};
use crate::error::{Result, StoreError};
use crate::partition::{reassemble, Partitioner};
use crate::pool::run_bounded;
use crate::types::{Chunk, ChunkKey, StateKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Client for the remote, size-limited primary store.
///
/// Each key is stored as ordered chunks under its canonical string. Keys are
/// processed in parallel on a bounded pool; the steps for one key are always
/// sequential.
pub struct PrimaryStore {
    backend: Arc<dyn ChunkBackend>,
    partitioner: Partitioner,
    retry: RetryPolicy,
    max_batch_write_items: usize,
    max_workers: usize,
    call_timeout: Duration,
    closed: AtomicBool,
}

impl PrimaryStore {
    /// Create a primary store over `backend`. The config must be validated.
    pub fn new(backend: Arc<dyn ChunkBackend>, config: &StateStoreConfig) -> Result<Self> {
        Ok(Self {
            backend,
            partitioner: config.partitioner()?,
            retry: config.retry.clone(),
            max_batch_write_items: config.max_batch_write_items,
            max_workers: config.max_workers,
            call_timeout: config.call_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Store each value, replacing any previous value of its key.
    ///
    /// Returns one result per entry, in input order. Entries sharing a key
    /// are applied in input order, so the last one wins.
    pub fn put_batch<V: AsRef<[u8]> + Sync>(
        &self,
        entries: &[(StateKey, V)],
        deadline: Instant,
    ) -> Vec<Result<()>> {
        let deadline = Deadline::new(deadline, self.call_timeout);

        let mut groups: Vec<(&StateKey, Vec<usize>)> = Vec::new();
        let mut group_of: HashMap<&StateKey, usize> = HashMap::new();
        for (idx, (key, _)) in entries.iter().enumerate() {
            let group = *group_of.entry(key).or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
            groups[group].1.push(idx);
        }

        let outcomes = run_bounded(self.max_workers, groups, |(key, indices)| {
            indices
                .into_iter()
                .map(|idx| (idx, self.put_one(key, entries[idx].1.as_ref(), &deadline)))
                .collect::<Vec<_>>()
        });

        let mut results: Vec<Option<Result<()>>> = (0..entries.len()).map(|_| None).collect();
        for (idx, result) in outcomes.into_iter().flatten() {
            results[idx] = Some(result);
        }
        results.into_iter().flatten().collect()
    }

    /// Read and reassemble each key.
    ///
    /// `Ok(None)` means the key has no chunks.
    pub fn get_batch(
        &self,
        keys: &[StateKey],
        deadline: Instant,
    ) -> HashMap<StateKey, Result<Option<Vec<u8>>>> {
        let deadline = Deadline::new(deadline, self.call_timeout);

        let mut unique: Vec<&StateKey> = Vec::with_capacity(keys.len());
        let mut seen = std::collections::HashSet::new();
        for key in keys {
            if seen.insert(key) {
                unique.push(key);
            }
        }

        run_bounded(self.max_workers, unique, |key| {
            (key.clone(), self.get_one(key, &deadline))
        })
        .into_iter()
        .collect()
    }

    /// Remove every chunk of a key. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &StateKey, deadline: Instant) -> Result<()> {
        let deadline = Deadline::new(deadline, self.call_timeout);
        self.delete_one(key, &deadline)
    }

    /// Remove every chunk of each key, returning one result per key.
    pub fn delete_batch(&self, keys: &[StateKey], deadline: Instant) -> Vec<Result<()>> {
        let deadline = Deadline::new(deadline, self.call_timeout);
        run_bounded(self.max_workers, keys.iter().collect(), |key| {
            self.delete_one(key, &deadline)
        })
    }

    /// Number of chunks currently stored for a key; 0 if none.
    pub fn partition_count(&self, key: &StateKey) -> Result<u64> {
        self.ensure_open()?;
        let deadline = Deadline::unbounded(self.call_timeout);
        Ok(self.discover(&key.canonical(), &deadline)?.len() as u64)
    }

    /// Release the backend client. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.close();
            debug!("primary store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Discover, write, prune.
    ///
    /// New chunks are written before stale ones are removed. Once the write
    /// has landed the prune runs to completion under the retry policy even if
    /// the batch deadline passes, so a key that reports success never keeps
    /// trailing chunks of an older value.
    fn put_one(&self, key: &StateKey, value: &[u8], deadline: &Deadline) -> Result<()> {
        self.ensure_open()?;
        let partition_key = key.canonical();
        if partition_key.len() > KEY_HEADROOM {
            return Err(StoreError::KeyTooLong {
                len: partition_key.len(),
                max: KEY_HEADROOM,
                key: partition_key,
            });
        }

        let existing = self.discover(&partition_key, deadline)?;

        let chunks = self.partitioner.chunks_for(&partition_key, value);
        let new_count = chunks.len() as u64;
        debug!(
            key = %partition_key,
            bytes = value.len(),
            chunks = new_count,
            previous = existing.len(),
            "writing chunks"
        );
        self.write(chunks.into_iter().map(WriteRequest::Put).collect(), deadline)?;

        let stale: Vec<_> = existing
            .into_iter()
            .filter(|&sort_key| sort_key >= new_count)
            .map(|sort_key| {
                WriteRequest::Delete(ChunkKey {
                    partition_key: partition_key.clone(),
                    sort_key,
                })
            })
            .collect();
        if !stale.is_empty() {
            debug!(key = %partition_key, stale = stale.len(), "pruning stale chunks");
            self.write(stale, &Deadline::unbounded(self.call_timeout))?;
        }

        Ok(())
    }

    fn get_one(&self, key: &StateKey, deadline: &Deadline) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let partition_key = key.canonical();

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut start_after = None;
        loop {
            let page = with_retry(&self.retry, deadline, "query", |timeout| {
                self.backend.query(&partition_key, start_after, timeout)
            })?;
            chunks.extend(page.chunks);
            match page.last_evaluated {
                Some(last) => start_after = Some(last),
                None => break,
            }
        }

        if chunks.is_empty() {
            return Ok(None);
        }
        chunks.sort_by_key(|c| c.sort_key);

        match reassemble(&partition_key, &chunks) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %partition_key, error = %e, "failed to reassemble value");
                Err(e)
            }
        }
    }

    fn delete_one(&self, key: &StateKey, deadline: &Deadline) -> Result<()> {
        self.ensure_open()?;
        let partition_key = key.canonical();

        let existing = self.discover(&partition_key, deadline)?;
        if existing.is_empty() {
            return Ok(());
        }

        debug!(key = %partition_key, chunks = existing.len(), "deleting chunks");
        let requests = existing
            .into_iter()
            .map(|sort_key| {
                WriteRequest::Delete(ChunkKey {
                    partition_key: partition_key.clone(),
                    sort_key,
                })
            })
            .collect();
        self.write(requests, deadline)
    }

    /// Sort keys currently stored under a partition.
    fn discover(&self, partition_key: &str, deadline: &Deadline) -> Result<Vec<u64>> {
        with_retry(&self.retry, deadline, "sort_keys", |timeout| {
            self.backend.sort_keys(partition_key, timeout)
        })
    }

    /// Apply requests in backend-sized batches, resubmitting unprocessed items.
    fn write(&self, requests: Vec<WriteRequest>, deadline: &Deadline) -> Result<()> {
        for batch in requests.chunks(self.max_batch_write_items) {
            let mut pending = batch.to_vec();
            let mut rounds = 0u32;

            loop {
                let unprocessed = with_retry(&self.retry, deadline, "batch_write", |timeout| {
                    self.backend.batch_write(&pending, timeout)
                })?;
                if unprocessed.is_empty() {
                    break;
                }

                rounds += 1;
                if rounds >= self.retry.max_attempts {
                    return Err(StoreError::PrimaryUnavailable {
                        operation: "batch_write",
                        attempts: rounds,
                        reason: format!("{} items left unprocessed", unprocessed.len()),
                    });
                }
                let delay = self.retry.backoff(rounds);
                warn!(
                    "batch_write: {} of {} items unprocessed (round {}), resubmitting in {:?}",
                    unprocessed.len(),
                    pending.len(),
                    rounds,
                    delay,
                );
                deadline.sleep(delay, "batch_write")?;
                pending = unprocessed;
            }
        }
        Ok(())
    }
}
