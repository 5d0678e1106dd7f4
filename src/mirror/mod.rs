//! Local mirror of full, unchunked values.
//!
//! Every saved value is also written here under its canonical key, so reads
//! can be served when the primary store is unreachable or has lost data.
//! The mirror is an append-only log file with an in-memory ordered index.

mod storage;

pub use storage::MirrorStore;
