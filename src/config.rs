//! Store configuration.

use crate::error::{Result, StoreError};
use crate::partition::Partitioner;
use crate::primary::{RetryPolicy, ITEM_ATTRIBUTE_OVERHEAD};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Room reserved in every item for the partition key.
pub const KEY_HEADROOM: usize = 1024;

/// Configuration for a [`StateStore`](crate::StateStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    /// Logical name of this store. Derives the table name and mirror file.
    pub namespace: String,

    /// Directory holding the mirror file.
    pub state_dir: PathBuf,

    /// Largest payload stored in one chunk.
    pub max_chunk_size: usize,

    /// Hard per-item ceiling of the backend.
    pub max_item_bytes: usize,

    /// Most items the backend accepts in one batch write.
    pub max_batch_write_items: usize,

    /// Keys processed concurrently against the backend.
    pub max_workers: usize,

    /// Timeout of a single backend call.
    pub call_timeout_ms: u64,

    /// Default overall deadline of a save, restore or delete.
    pub batch_deadline_ms: u64,

    /// Values cached by the mirror for repeated reads.
    pub mirror_cache_entries: usize,

    pub retry: RetryPolicy,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "runstate".to_string(),
            state_dir: PathBuf::from("./state"),
            max_chunk_size: 400_000,
            max_item_bytes: 400 * 1024,
            max_batch_write_items: 25,
            max_workers: 8,
            call_timeout_ms: 10_000,
            batch_deadline_ms: 60_000,
            mirror_cache_entries: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl StateStoreConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits and paths. Failures are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(StoreError::Configuration(msg));

        if self.namespace.trim().is_empty() {
            return fail("namespace must not be empty".into());
        }
        if self.state_dir.as_os_str().is_empty() {
            return fail("state_dir must not be empty".into());
        }
        if self.max_chunk_size == 0 {
            return fail("max_chunk_size must be positive".into());
        }
        let needed = self.max_chunk_size + KEY_HEADROOM + ITEM_ATTRIBUTE_OVERHEAD;
        if needed > self.max_item_bytes {
            return fail(format!(
                "max_chunk_size {} leaves no headroom under the item limit {} (needs {})",
                self.max_chunk_size, self.max_item_bytes, needed
            ));
        }
        if self.max_batch_write_items == 0 {
            return fail("max_batch_write_items must be positive".into());
        }
        if self.max_workers == 0 {
            return fail("max_workers must be positive".into());
        }
        if self.call_timeout_ms == 0 || self.batch_deadline_ms == 0 {
            return fail("timeouts must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return fail("retry.backoff_factor must be at least 1.0".into());
        }
        Ok(())
    }

    /// Namespace with path separators flattened.
    fn flat_namespace(&self) -> String {
        self.namespace.trim_matches('/').replace('/', "-")
    }

    /// Backend table holding the chunks.
    pub fn table_name(&self) -> String {
        self.flat_namespace()
    }

    /// File holding the mirror.
    pub fn mirror_path(&self) -> PathBuf {
        self.state_dir.join(self.flat_namespace())
    }

    pub fn partitioner(&self) -> Result<Partitioner> {
        NonZeroUsize::new(self.max_chunk_size)
            .map(Partitioner::new)
            .ok_or_else(|| StoreError::Configuration("max_chunk_size must be positive".into()))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }
}
