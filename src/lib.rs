//! # Run-State Store
//!
//! Durable persistence of a job scheduler's run state, surviving process
//! restarts, crashes and loss of the remote store.
//!
//! ## Core Concepts
//!
//! - **Keys**: `(name, identifier)` pairs rendered to one canonical string
//! - **Chunks**: values split to fit the remote store's per-item limit
//! - **Primary store**: the remote partitioned key-value service holding chunks
//! - **Mirror**: a local file holding every full value, read when the primary
//!   is unavailable or has lost a key
//!
//! ## Example
//!
//! ```ignore
//! use runstate::{KeyBuilder, MemoryBackend, StateStore, StateStoreConfig};
//! use std::sync::Arc;
//!
//! let config = StateStoreConfig {
//!     namespace: "scheduler".into(),
//!     state_dir: "./state".into(),
//!     ..Default::default()
//! };
//! let backend = Arc::new(MemoryBackend::new(config.table_name()));
//! let store = StateStore::open(config, backend)?;
//!
//! let key = KeyBuilder::build("job_state", "nightly.0");
//! let report = store.save(&[(key.clone(), serialized_job)]);
//! assert!(report.is_success());
//!
//! let restored = store.restore(&[key]);
//! store.cleanup()?;
//! ```

pub mod config;
pub mod error;
pub mod mirror;
pub mod partition;
mod pool;
pub mod primary;
pub mod store;
pub mod types;

// Re-exports
pub use config::StateStoreConfig;
pub use error::{Result, StoreError};
pub use mirror::MirrorStore;
pub use partition::{reassemble, Partitioner};
pub use primary::{
    BackendError, BackendLimits, ChunkBackend, MemoryBackend, PrimaryStore, QueryPage,
    RetryPolicy, WriteRequest,
};
pub use store::{DeleteReport, RestoreOutcome, SaveOutcome, SaveReport, StateStore};
pub use types::*;
