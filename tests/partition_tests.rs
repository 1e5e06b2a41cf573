//! Property tests for chunk partitioning
//!
//! For every total and worker count the chunks must be contiguous,
//! non-overlapping, indexed in order, and cover `[0, total)` exactly.

use chunkpool::{partition, partition_capped, Chunk, Error};
use proptest::prelude::*;

fn assert_exact_cover(chunks: &[Chunk], total: u64) -> Result<(), TestCaseError> {
    let mut next = 0u64;
    for (position, chunk) in chunks.iter().enumerate() {
        prop_assert_eq!(chunk.index, position);
        prop_assert_eq!(chunk.offset, next, "gap or overlap before chunk {}", position);
        prop_assert!(chunk.len > 0, "empty chunk {}", position);
        next = chunk.end();
    }
    prop_assert_eq!(next, total);
    prop_assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), total);
    Ok(())
}

proptest! {
    #[test]
    fn prop_partition_covers_range(total in 0u64..1_000_000, workers in 1usize..64) {
        let chunks = partition(total, workers).unwrap();
        assert_exact_cover(&chunks, total)?;
        prop_assert!(chunks.len() <= workers);
    }

    #[test]
    fn prop_chunks_share_one_size_except_last(total in 1u64..100_000, workers in 1usize..32) {
        let chunks = partition(total, workers).unwrap();
        let size = total.div_ceil(workers as u64);
        for chunk in &chunks[..chunks.len() - 1] {
            prop_assert_eq!(chunk.len, size);
        }
        prop_assert!(chunks[chunks.len() - 1].len <= size);
    }

    #[test]
    fn prop_capped_partition_respects_cap(
        total in 0u64..200_000,
        workers in 1usize..16,
        cap in 1u64..5_000,
    ) {
        let chunks = partition_capped(total, workers, cap).unwrap();
        assert_exact_cover(&chunks, total)?;
        prop_assert!(chunks.iter().all(|c| c.len <= cap));
    }

    #[test]
    fn prop_partition_is_deterministic(total in 0u64..50_000, workers in 1usize..16) {
        prop_assert_eq!(partition(total, workers).unwrap(), partition(total, workers).unwrap());
    }

    #[test]
    fn prop_slices_reassemble_items(items in prop::collection::vec(any::<u8>(), 0..300), workers in 1usize..12) {
        let chunks = partition(items.len() as u64, workers).unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.slice(&items).to_vec()).collect();
        prop_assert_eq!(joined, items);
    }
}

#[test]
fn test_zero_total_is_empty_not_error() {
    assert_eq!(partition(0, 1).unwrap(), Vec::new());
    assert_eq!(partition(0, 16).unwrap(), Vec::new());
}

#[test]
fn test_zero_workers_is_invalid_argument() {
    assert!(matches!(partition(100, 0), Err(Error::InvalidArgument { .. })));
    assert!(matches!(
        partition_capped(100, 0, 10),
        Err(Error::InvalidArgument { .. })
    ));
}

#[test]
fn test_file_style_offsets() {
    // 1 GiB file over 8 workers, capped at 100 MiB per read
    let total = 1u64 << 30;
    let cap = 100 * 1024 * 1024;
    let chunks = partition_capped(total, 8, cap).unwrap();
    assert_eq!(chunks.len(), 11);
    assert_eq!(chunks[1].offset, cap);
    assert_eq!(chunks[10].len, total - 10 * cap);
}

#[test]
fn test_unallocatable_chunk_count_is_invalid_argument() {
    assert!(matches!(
        partition_capped(u64::MAX, 1, 1),
        Err(Error::InvalidArgument { .. })
    ));
    // A huge total stays fine when the cap keeps the count small
    assert_eq!(partition_capped(u64::MAX, 4, u64::MAX / 2).unwrap().len(), 4);
}
