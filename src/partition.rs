//! Splitting values into chunks and reassembling them.
//!
//! A value is stored as `N = max(1, ceil(len / max_chunk_size))` chunks with
//! sort keys `0..N`. An empty value is one empty chunk, so a count of zero
//! always means "never written or deleted".
//!
//! Every chunk records `N` for the generation it was written with. That lets
//! a reader ignore stale trailing chunks left behind by an interrupted
//! overwrite, and reject a set mixing two generations instead of returning
//! spliced bytes.

use crate::error::{Result, StoreError};
use crate::types::Chunk;
use std::num::NonZeroUsize;

/// Splits and reassembles values under a fixed chunk size.
#[derive(Clone, Copy, Debug)]
pub struct Partitioner {
    max_chunk_size: NonZeroUsize,
}

impl Partitioner {
    pub fn new(max_chunk_size: NonZeroUsize) -> Self {
        Self { max_chunk_size }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size.get()
    }

    /// Number of chunks a value of `len` bytes occupies.
    pub fn chunk_count(&self, len: usize) -> u64 {
        len.div_ceil(self.max_chunk_size.get()).max(1) as u64
    }

    /// Split a value into ordered payload slices.
    pub fn split<'a>(&self, value: &'a [u8]) -> Vec<&'a [u8]> {
        if value.is_empty() {
            return vec![value];
        }
        value.chunks(self.max_chunk_size.get()).collect()
    }

    /// Split a value into addressed chunks under `partition_key`.
    pub fn chunks_for(&self, partition_key: &str, value: &[u8]) -> Vec<Chunk> {
        let chunk_count = self.chunk_count(value.len());
        self.split(value)
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Chunk {
                partition_key: partition_key.to_string(),
                sort_key: i as u64,
                chunk_count,
                payload: payload.to_vec(),
            })
            .collect()
    }
}

/// Reassemble a value from chunks sorted ascending by sort key.
///
/// Chunks at or beyond the declared count are ignored. A missing sort key
/// below the declared count, or a chunk declaring a different count, is
/// reported as [`StoreError::CorruptPartitionSet`].
pub fn reassemble(partition_key: &str, chunks: &[Chunk]) -> Result<Vec<u8>> {
    let corrupt = |reason: String| StoreError::CorruptPartitionSet {
        partition_key: partition_key.to_string(),
        reason,
    };

    let first = chunks
        .first()
        .ok_or_else(|| corrupt("no chunks".into()))?;
    let expected = first.chunk_count;
    if expected == 0 {
        return Err(corrupt("chunk declares a count of zero".into()));
    }

    let mut value = Vec::new();
    let mut next = 0u64;

    for chunk in chunks {
        if chunk.sort_key >= expected {
            break;
        }
        if chunk.sort_key != next {
            return Err(corrupt(format!(
                "missing sort key {} (found {})",
                next, chunk.sort_key
            )));
        }
        if chunk.chunk_count != expected {
            return Err(corrupt(format!(
                "sort key {} belongs to a {}-chunk value, expected {}",
                chunk.sort_key, chunk.chunk_count, expected
            )));
        }
        value.extend_from_slice(&chunk.payload);
        next += 1;
    }

    if next != expected {
        return Err(corrupt(format!(
            "missing sort key {} of {}",
            next, expected
        )));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn partitioner(size: usize) -> Partitioner {
        Partitioner::new(NonZeroUsize::new(size).unwrap())
    }

    #[test]
    fn test_empty_value_is_one_chunk() {
        let p = partitioner(4);
        assert_eq!(p.chunk_count(0), 1);

        let chunks = p.chunks_for("k", b"");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.is_empty());
        assert_eq!(reassemble("k", &chunks).unwrap(), b"");
    }

    #[test]
    fn test_chunk_boundaries() {
        let p = partitioner(4);
        assert_eq!(p.chunk_count(4), 1);
        assert_eq!(p.chunk_count(5), 2);
        assert_eq!(p.chunk_count(8), 2);

        let chunks = p.chunks_for("k", b"abcdefghij");
        let payloads: Vec<_> = chunks.iter().map(|c| c.payload.as_slice()).collect();
        assert_eq!(payloads, vec![&b"abcd"[..], b"efgh", b"ij"]);
        assert!(chunks.iter().all(|c| c.chunk_count == 3));
        assert_eq!(
            chunks.iter().map(|c| c.sort_key).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_gap_is_corruption() {
        let p = partitioner(2);
        let mut chunks = p.chunks_for("k", b"aabbcc");
        chunks.remove(1);

        let err = reassemble("k", &chunks).unwrap_err();
        assert!(matches!(err, StoreError::CorruptPartitionSet { .. }));
    }

    #[test]
    fn test_missing_tail_is_corruption() {
        let p = partitioner(2);
        let mut chunks = p.chunks_for("k", b"aabbcc");
        chunks.pop();

        assert!(matches!(
            reassemble("k", &chunks),
            Err(StoreError::CorruptPartitionSet { .. })
        ));
    }

    #[test]
    fn test_stale_trailing_chunks_ignored() {
        let p = partitioner(2);
        let mut chunks = p.chunks_for("k", b"xy");
        // Leftovers of an older, longer generation.
        chunks.extend(p.chunks_for("k", b"oldoldold").into_iter().skip(1));

        assert_eq!(reassemble("k", &chunks).unwrap(), b"xy");
    }

    #[test]
    fn test_mixed_generations_rejected() {
        let p = partitioner(2);
        let mut chunks = p.chunks_for("k", b"newnew");
        chunks[1] = p.chunks_for("k", b"oldoldold").remove(1);

        assert!(matches!(
            reassemble("k", &chunks),
            Err(StoreError::CorruptPartitionSet { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_split_then_reassemble(
            value in proptest::collection::vec(any::<u8>(), 0..2048),
            size in 1usize..300,
        ) {
            let p = partitioner(size);
            let chunks = p.chunks_for("k", &value);
            prop_assert_eq!(chunks.len() as u64, p.chunk_count(value.len()));
            prop_assert!(chunks.iter().all(|c| c.payload.len() <= size));
            prop_assert_eq!(reassemble("k", &chunks).unwrap(), value);
        }
    }
}
