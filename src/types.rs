//! Core types for the run-state store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the name and identifier in a canonical key.
const KEY_SEPARATOR: char = ' ';

/// Escape character used inside the name part of a canonical key.
const KEY_ESCAPE: char = '\\';

/// Logical key for a piece of persisted scheduler state.
///
/// A key is a `(name, identifier)` pair, e.g. a job name and a run number.
/// It renders to a single canonical string that is used both as the remote
/// partition key and as the mirror lookup key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    name: String,
    identifier: String,
}

impl StateKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Render the canonical string.
    ///
    /// Backslashes and spaces inside the name are escaped, so the first
    /// unescaped space always ends the name and rendering is injective.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + self.identifier.len() + 1);
        for c in self.name.chars() {
            if c == KEY_ESCAPE || c == KEY_SEPARATOR {
                out.push(KEY_ESCAPE);
            }
            out.push(c);
        }
        out.push(KEY_SEPARATOR);
        out.push_str(&self.identifier);
        out
    }

    /// Parse a canonical string back into a key.
    ///
    /// Returns `None` for strings that no key renders to.
    pub fn parse(canonical: &str) -> Option<Self> {
        let mut name = String::new();
        let mut chars = canonical.char_indices();

        while let Some((i, c)) = chars.next() {
            match c {
                KEY_ESCAPE => match chars.next() {
                    Some((_, e)) if e == KEY_ESCAPE || e == KEY_SEPARATOR => name.push(e),
                    _ => return None,
                },
                KEY_SEPARATOR => {
                    let identifier = canonical[i + c.len_utf8()..].to_string();
                    return Some(StateKey { name, identifier });
                }
                other => name.push(other),
            }
        }

        None
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({:?}, {:?})", self.name, self.identifier)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Builds state keys from scheduler names.
pub struct KeyBuilder;

impl KeyBuilder {
    /// Build a key from a name and an identifier.
    ///
    /// The canonical form may be at most [`KEY_HEADROOM`](crate::config::KEY_HEADROOM)
    /// bytes; longer keys are kept by the mirror but rejected by the primary
    /// store with [`StoreError::KeyTooLong`](crate::StoreError::KeyTooLong).
    pub fn build(name: impl Into<String>, identifier: impl ToString) -> StateKey {
        StateKey {
            name: name.into(),
            identifier: identifier.to_string(),
        }
    }
}

/// Address of one chunk in the primary store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub partition_key: String,
    pub sort_key: u64,
}

/// One size-bounded fragment of a stored value.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Canonical key of the value this chunk belongs to.
    pub partition_key: String,
    /// Zero-based position within the value.
    pub sort_key: u64,
    /// Number of chunks in the value generation this chunk was written with.
    pub chunk_count: u64,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            partition_key: self.partition_key.clone(),
            sort_key: self.sort_key,
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk({}, {}/{}, {} bytes)",
            self.partition_key,
            self.sort_key,
            self.chunk_count,
            self.payload.len()
        )
    }
}
