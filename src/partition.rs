//! Deterministic workload partitioning
//!
//! Splits `[0, total)` into contiguous chunk descriptors of `ceil(total / num_workers)`
//! units each, the last one clamped. The output depends only on the arguments,
//! never on scheduling, so a chunk index identifies the same range on every run.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A contiguous sub-range of the workload assigned to one invocation
///
/// Chunks are immutable once created and carry their position in the
/// submission order as `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position in the chunk sequence
    pub index: usize,
    /// First unit covered (byte offset, first number, first item)
    pub offset: u64,
    /// Number of units covered
    pub len: u64,
}

impl Chunk {
    /// Create a chunk descriptor
    pub fn new(index: usize, offset: u64, len: u64) -> Self {
        Self { index, offset, len }
    }

    /// One past the last unit covered
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// The covered units as a half-open range
    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    /// Returns true if this chunk covers nothing
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The items of `items` this chunk covers
    ///
    /// Ranges past the end of `items` are clamped, so a chunk list built for a
    /// larger total yields shorter (possibly empty) slices instead of panicking.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let len = items.len() as u64;
        let start = self.offset.min(len) as usize;
        let end = self.end().min(len) as usize;
        &items[start..end]
    }
}

/// Partition `[0, total)` into at most `num_workers` chunks
///
/// # Errors
/// * `InvalidArgument` if `num_workers == 0`
///
/// `total == 0` yields an empty list.
///
/// # Example
/// ```
/// use chunkpool::partition;
///
/// let chunks = partition(10, 3).unwrap();
/// let lens: Vec<u64> = chunks.iter().map(|c| c.len).collect();
/// assert_eq!(lens, vec![4, 4, 2]);
/// ```
pub fn partition(total: u64, num_workers: usize) -> Result<Vec<Chunk>> {
    if num_workers == 0 {
        return Err(Error::invalid("num_workers must be at least 1"));
    }
    split(total, total.div_ceil(num_workers as u64))
}

/// Partition with an upper bound on chunk length
///
/// When `ceil(total / num_workers)` exceeds `max_chunk_size` the chunks are cut
/// at the cap instead, so the chunk count grows past `num_workers`.
///
/// # Errors
/// * `InvalidArgument` if `num_workers == 0` or `max_chunk_size == 0`
/// * `InvalidArgument` if the cap yields more chunks than can be allocated
pub fn partition_capped(total: u64, num_workers: usize, max_chunk_size: u64) -> Result<Vec<Chunk>> {
    if num_workers == 0 {
        return Err(Error::invalid("num_workers must be at least 1"));
    }
    if max_chunk_size == 0 {
        return Err(Error::invalid("max_chunk_size must be at least 1"));
    }
    let chunk_size = total.div_ceil(num_workers as u64).min(max_chunk_size);
    split(total, chunk_size)
}

fn split(total: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if total == 0 {
        return Ok(Vec::new());
    }

    let count = total.div_ceil(chunk_size);
    let too_many = || {
        Error::invalid(format!(
            "{} chunks of {} cannot be allocated; raise max_chunk_size",
            count, chunk_size
        ))
    };
    let mut chunks = Vec::new();
    chunks
        .try_reserve_exact(usize::try_from(count).map_err(|_| too_many())?)
        .map_err(|_| too_many())?;
    let mut offset = 0u64;
    while offset < total {
        let len = chunk_size.min(total - offset);
        chunks.push(Chunk::new(chunks.len(), offset, len));
        offset += len;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(chunks: &[Chunk], total: u64) {
        let mut expected = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.offset, expected);
            assert!(chunk.len > 0);
            expected = chunk.end();
        }
        assert_eq!(expected, total);
    }

    #[test]
    fn test_even_split() {
        let chunks = partition(100, 4).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len == 25));
        assert_covers(&chunks, 100);
    }

    #[test]
    fn test_last_chunk_clamped() {
        let chunks = partition(10, 4).unwrap();
        let lens: Vec<u64> = chunks.iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![3, 3, 3, 1]);
        assert_covers(&chunks, 10);
    }

    #[test]
    fn test_more_workers_than_units() {
        let chunks = partition(3, 8).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_covers(&chunks, 3);
    }

    #[test]
    fn test_empty_total() {
        assert!(partition(0, 4).unwrap().is_empty());
        assert!(partition_capped(0, 4, 10).unwrap().is_empty());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            partition(10, 0),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_capped_grows_chunk_count() {
        let chunks = partition_capped(100, 2, 30).unwrap();
        let lens: Vec<u64> = chunks.iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![30, 30, 30, 10]);
        assert_covers(&chunks, 100);
    }

    #[test]
    fn test_cap_above_natural_size_is_ignored() {
        assert_eq!(partition_capped(100, 4, 1000).unwrap(), partition(100, 4).unwrap());
    }

    #[test]
    fn test_zero_cap_rejected() {
        assert!(partition_capped(10, 2, 0).is_err());
    }

    #[test]
    fn test_slice() {
        let letters: Vec<char> = ('a'..='z').collect();
        let chunks = partition(letters.len() as u64, 4).unwrap();
        let joined: Vec<char> = chunks
            .iter()
            .flat_map(|c| c.slice(&letters).iter().copied())
            .collect();
        assert_eq!(joined, letters);
        assert_eq!(chunks[0].slice(&letters), &letters[0..7]);
    }

    #[test]
    fn test_slice_clamps_past_end() {
        let items = [1, 2, 3];
        assert_eq!(Chunk::new(0, 2, 5).slice(&items), &[3]);
        assert!(Chunk::new(1, 9, 5).slice(&items).is_empty());
    }
}
