//! The run-state store the scheduler talks to.

use crate::config::StateStoreConfig;
use crate::error::{Result, StoreError};
use crate::mirror::MirrorStore;
use crate::primary::{ChunkBackend, PrimaryStore};
use crate::types::StateKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of saving one key.
#[derive(Debug)]
pub struct SaveOutcome {
    pub key: StateKey,
    pub primary: Result<()>,
    pub mirror: Result<()>,
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        self.primary.is_ok() && self.mirror.is_ok()
    }
}

/// Per-key results of a save, in input order.
#[derive(Debug, Default)]
pub struct SaveReport {
    pub outcomes: Vec<SaveOutcome>,
}

impl SaveReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(SaveOutcome::is_success)
    }

    /// Outcomes where at least one store failed.
    pub fn failures(&self) -> impl Iterator<Item = &SaveOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// The last outcome recorded for `key`.
    pub fn outcome(&self, key: &StateKey) -> Option<&SaveOutcome> {
        self.outcomes.iter().rev().find(|o| &o.key == key)
    }
}

/// Values found by a restore.
///
/// A key appears in at most one of `values` and `failures`. Keys in neither
/// have no saved state.
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub values: HashMap<StateKey, Vec<u8>>,
    pub failures: HashMap<StateKey, StoreError>,
    /// Keys whose value was served by the mirror.
    pub from_mirror: HashSet<StateKey>,
}

/// Keys whose primary chunks could not be deleted.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub failures: Vec<(StateKey, StoreError)>,
}

impl DeleteReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Persisted run state: chunked in the primary store, mirrored locally.
///
/// Saves write both stores independently and report each per key. Restores
/// prefer the primary and fall back to the mirror for keys the primary does
/// not have or cannot serve. Deletes only touch the primary; the mirror copy
/// is kept as the redundancy.
pub struct StateStore {
    config: StateStoreConfig,
    primary: PrimaryStore,
    /// Single writer: every mirror access goes through this lock.
    mirror: Mutex<MirrorStore>,
}

impl StateStore {
    /// Open the store.
    ///
    /// Fails with [`StoreError::Configuration`] for an invalid config or a
    /// missing table. An unreachable backend is not fatal: the store opens
    /// degraded and serves reads from the mirror.
    pub fn open(config: StateStoreConfig, backend: Arc<dyn ChunkBackend>) -> Result<Self> {
        config.validate()?;

        let table = config.table_name();
        match backend.check_table(&table) {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(table = %table, error = %e, "backend unreachable at open, continuing degraded");
            }
            Err(e) => {
                return Err(StoreError::Configuration(format!("table {table}: {e}")));
            }
        }

        let primary = PrimaryStore::new(backend, &config)?;
        let mirror = MirrorStore::open(config.mirror_path(), config.mirror_cache_entries)?;

        info!(
            table = %table,
            mirror = %config.mirror_path().display(),
            max_chunk_size = config.max_chunk_size,
            "state store opened"
        );

        Ok(Self {
            config,
            primary,
            mirror: Mutex::new(mirror),
        })
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + self.config.batch_deadline()
    }

    // --- Save ---

    /// Save values under the configured batch deadline.
    pub fn save<V: AsRef<[u8]> + Sync>(&self, pairs: &[(StateKey, V)]) -> SaveReport {
        self.save_with_deadline(pairs, self.default_deadline())
    }

    /// Save values to both stores.
    ///
    /// Both writes are attempted for every key whatever happens to the
    /// other, and failures are reported per key, never dropped.
    pub fn save_with_deadline<V: AsRef<[u8]> + Sync>(
        &self,
        pairs: &[(StateKey, V)],
        deadline: Instant,
    ) -> SaveReport {
        let mirror_results: Vec<Result<()>> = {
            let mut mirror = self.mirror.lock();
            pairs
                .iter()
                .map(|(key, value)| {
                    mirror.put(&key.canonical(), value.as_ref()).inspect_err(|e| {
                        warn!(key = %key, error = %e, "mirror write failed");
                    })
                })
                .collect()
        };

        let primary_results = self.primary.put_batch(pairs, deadline);

        let outcomes: Vec<SaveOutcome> = pairs
            .iter()
            .zip(primary_results)
            .zip(mirror_results)
            .map(|(((key, _), primary), mirror)| {
                if let Err(e) = &primary {
                    warn!(key = %key, error = %e, "primary write failed");
                }
                SaveOutcome {
                    key: key.clone(),
                    primary,
                    mirror,
                }
            })
            .collect();

        let report = SaveReport { outcomes };
        debug!(
            keys = pairs.len(),
            failed = report.failures().count(),
            "save finished"
        );
        report
    }

    /// Save one value. Both stores are written; the primary's error is
    /// returned first if both fail.
    pub fn put(&self, key: &StateKey, value: &[u8]) -> Result<()> {
        let mut report = self.save(&[(key.clone(), value)]);
        match report.outcomes.pop() {
            Some(outcome) => outcome.primary.and(outcome.mirror),
            None => Ok(()),
        }
    }

    // --- Restore ---

    /// Restore values under the configured batch deadline.
    pub fn restore(&self, keys: &[StateKey]) -> RestoreOutcome {
        self.restore_with_deadline(keys, self.default_deadline())
    }

    /// Restore values, preferring the primary store.
    ///
    /// Keys without chunks, or whose primary read failed with a backend
    /// outage, are looked up in the mirror. A corrupt chunk set is reported
    /// as a failure. When the primary failed and the mirror has nothing
    /// either, the primary error is reported rather than claiming absence.
    pub fn restore_with_deadline(&self, keys: &[StateKey], deadline: Instant) -> RestoreOutcome {
        let mut outcome = RestoreOutcome::default();
        let mut fallback: Vec<(StateKey, Option<StoreError>)> = Vec::new();

        for (key, result) in self.primary.get_batch(keys, deadline) {
            match result {
                Ok(Some(value)) => {
                    outcome.values.insert(key, value);
                }
                Ok(None) => fallback.push((key, None)),
                Err(e) if e.is_primary_failure() => {
                    warn!(key = %key, error = %e, "primary read failed, falling back to mirror");
                    fallback.push((key, Some(e)));
                }
                Err(e) => {
                    outcome.failures.insert(key, e);
                }
            }
        }

        if !fallback.is_empty() {
            let mut mirror = self.mirror.lock();
            for (key, primary_error) in fallback {
                match mirror.get(&key.canonical()) {
                    Ok(Some(value)) => {
                        debug!(key = %key, bytes = value.len(), "restored from mirror");
                        outcome.from_mirror.insert(key.clone());
                        outcome.values.insert(key, value);
                    }
                    Ok(None) => {
                        if let Some(e) = primary_error {
                            outcome.failures.insert(key, e);
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "mirror read failed");
                        outcome.failures.insert(key, e);
                    }
                }
            }
        }

        outcome
    }

    /// Restore one value.
    pub fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>> {
        let mut outcome = self.restore(std::slice::from_ref(key));
        if let Some(e) = outcome.failures.remove(key) {
            return Err(e);
        }
        Ok(outcome.values.remove(key))
    }

    // --- Delete ---

    /// Delete primary chunks under the configured batch deadline.
    pub fn delete(&self, keys: &[StateKey]) -> DeleteReport {
        self.delete_with_deadline(keys, self.default_deadline())
    }

    /// Delete the primary chunks of each key. Mirror copies are kept.
    pub fn delete_with_deadline(&self, keys: &[StateKey], deadline: Instant) -> DeleteReport {
        let failures = keys
            .iter()
            .zip(self.primary.delete_batch(keys, deadline))
            .filter_map(|(key, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "delete failed");
                    Some((key.clone(), e))
                }
            })
            .collect();
        DeleteReport { failures }
    }

    // --- Introspection ---

    /// Number of primary chunks stored for a key; 0 if none.
    pub fn partition_count(&self, key: &StateKey) -> Result<u64> {
        self.primary.partition_count(key)
    }

    /// Keys held by the mirror, in canonical order.
    pub fn mirrored_keys(&self) -> Result<Vec<StateKey>> {
        let mirror = self.mirror.lock();
        if mirror.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(mirror.keys().filter_map(StateKey::parse).collect())
    }

    // --- Lifecycle ---

    /// Close the mirror and release the backend client.
    ///
    /// Safe to call repeatedly and before any save.
    pub fn cleanup(&self) -> Result<()> {
        let was_open = !self.primary.is_closed();
        self.primary.close();
        let closed = self.mirror.lock().close();
        if was_open {
            info!(namespace = %self.config.namespace, "state store cleaned up");
        }
        closed
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        // Best-effort release on drop
        let _ = self.cleanup();
    }
}
