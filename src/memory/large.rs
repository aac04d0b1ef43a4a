//! Large blocks: requests above the fixed-size range go straight to the
//! platform allocator, rounded up to whole page allocations.

use super::block_info::{BlockType, MetadataTable};
use super::error::MemoryError;
use super::platform::{PAGE_ALLOCATION_SIZE, PlatformMemory, PlatformOps};
use super::stats::AllocatorStats;
use std::ptr::NonNull;

/// Bytes actually reserved for a large request of `size` bytes aligned to
/// `alignment`. `None` on overflow.
#[inline]
#[must_use]
pub fn large_block_size(size: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two() && alignment <= PAGE_ALLOCATION_SIZE);
    size.max(1)
        .checked_next_multiple_of(alignment)?
        .checked_next_multiple_of(PAGE_ALLOCATION_SIZE)
}

/// Allocate a large block. Every platform allocation is aligned to
/// [`PAGE_ALLOCATION_SIZE`], which covers any `alignment` up to it.
pub(crate) fn allocate(
    size: usize,
    alignment: usize,
    metadata: &MetadataTable,
    stats: &AllocatorStats,
) -> Result<NonNull<u8>, MemoryError> {
    let block_size = large_block_size(size, alignment).ok_or(MemoryError::SizeOverflow { size })?;
    let ptr = PlatformMemory::alloc(block_size)?;

    match metadata.initialize_or_find(ptr, BlockType::Large) {
        Ok(info) => info.set_allocated_size(block_size),
        Err(e) => {
            // Safety: ptr was never handed out.
            drop(unsafe { PlatformMemory::release(ptr, block_size) });
            return Err(e);
        }
    }

    stats.allocated_large.add(block_size);
    stats.used_large.add(block_size);
    stats.live_large_blocks.add(1);
    Ok(ptr)
}

/// Reserved size of a live large block.
pub(crate) fn block_size(ptr: NonNull<u8>, metadata: &MetadataTable) -> usize {
    let info = metadata.find_existing(ptr);
    assert_eq!(info.block_type(), BlockType::Large, "{ptr:p} is not a large block");
    info.allocated_size()
}

/// Release a large block.
///
/// # Safety
/// `ptr` must have been returned by [`allocate`] with the same metadata table
/// and not freed since.
pub(crate) unsafe fn free(ptr: NonNull<u8>, metadata: &MetadataTable, stats: &AllocatorStats) {
    let info = metadata.find_existing(ptr);
    assert_eq!(info.block_type(), BlockType::Large, "{ptr:p} is not a large block");
    integrity_assert!(
        (ptr.as_ptr() as usize).is_multiple_of(PAGE_ALLOCATION_SIZE),
        "{ptr:p} is not the start of a large block"
    );
    let block_size = info.allocated_size();
    metadata.deinitialize(info);

    // Safety: upheld by caller; block_size is what allocate() reserved.
    if let Err(e) = unsafe { PlatformMemory::release(ptr, block_size) } {
        tracing::warn!("failed to release large block {ptr:p} ({block_size} bytes): {e}");
    }

    stats.allocated_large.sub(block_size);
    stats.used_large.sub(block_size);
    stats.live_large_blocks.sub(1);
}

/// Release every large block still registered in `metadata`. Returns how
/// many were released.
///
/// # Safety
/// No registered large block may be used afterwards, and no other thread may
/// allocate or free through `metadata` concurrently.
pub(crate) unsafe fn release_leaked(metadata: &MetadataTable, stats: &AllocatorStats) -> usize {
    let leaked = metadata.owned_blocks(BlockType::Large);
    for &ptr in &leaked {
        // Safety: upheld by caller; every owned Large record was registered by allocate().
        unsafe { free(ptr, metadata, stats) };
    }
    leaked.len()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::block_info::DEFAULT_ADDRESS_BITS;

    fn setup() -> (MetadataTable, AllocatorStats) {
        let metadata = MetadataTable::new(DEFAULT_ADDRESS_BITS);
        metadata.prepare().unwrap();
        (metadata, AllocatorStats::default())
    }

    #[test]
    fn test_large_block_size_rounding() {
        assert_eq!(large_block_size(4097, 16), Some(PAGE_ALLOCATION_SIZE));
        assert_eq!(large_block_size(PAGE_ALLOCATION_SIZE, 16), Some(PAGE_ALLOCATION_SIZE));
        assert_eq!(large_block_size(PAGE_ALLOCATION_SIZE + 1, 16), Some(2 * PAGE_ALLOCATION_SIZE));
        assert_eq!(large_block_size(0, 4096), Some(PAGE_ALLOCATION_SIZE));
        assert_eq!(large_block_size(usize::MAX - 8, 16), None);
    }

    #[test]
    fn test_alloc_registers_metadata_and_stats() {
        let (metadata, stats) = setup();
        let p = allocate(100_000, 16, &metadata, &stats).unwrap();
        assert!((p.as_ptr() as usize).is_multiple_of(PAGE_ALLOCATION_SIZE));

        let info = metadata.find_existing(p);
        assert_eq!(info.block_type(), BlockType::Large);
        assert_eq!(info.allocated_size(), 2 * PAGE_ALLOCATION_SIZE);
        assert_eq!(block_size(p, &metadata), 2 * PAGE_ALLOCATION_SIZE);
        assert_eq!(stats.used_large.get(), 2 * PAGE_ALLOCATION_SIZE);
        assert_eq!(stats.live_large_blocks.get(), 1);

        // Safety: Test code.
        unsafe { free(p, &metadata, &stats) };
        assert!(!info.is_owned());
        assert_eq!(stats.allocated_large.get(), 0);
        assert_eq!(stats.used_large.get(), 0);
        assert_eq!(stats.live_large_blocks.get(), 0);
    }

    #[test]
    fn test_large_data_round_trip() {
        let (metadata, stats) = setup();
        let size = 300_000;
        let p = allocate(size, 16, &metadata, &stats).unwrap();
        // Safety: Test code, `size` bytes were requested.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(p.as_ptr(), size);
            for (i, b) in slice.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            assert!(slice.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
            free(p, &metadata, &stats);
        }
    }

    #[test]
    fn test_overflow_is_an_error() {
        let (metadata, stats) = setup();
        let err = allocate(usize::MAX - 1, 16, &metadata, &stats).unwrap_err();
        assert!(matches!(err, MemoryError::SizeOverflow { .. }));
        assert_eq!(stats.live_large_blocks.get(), 0);
    }

    #[test]
    fn test_release_leaked_blocks() {
        let (metadata, stats) = setup();
        let _ = allocate(70_000, 16, &metadata, &stats).unwrap();
        let _ = allocate(200_000, 4096, &metadata, &stats).unwrap();
        let freed = allocate(5_000, 16, &metadata, &stats).unwrap();
        // Safety: Test code.
        unsafe { free(freed, &metadata, &stats) };
        assert_eq!(stats.live_large_blocks.get(), 2);

        // Safety: Test code, nothing touches the blocks afterwards.
        assert_eq!(unsafe { release_leaked(&metadata, &stats) }, 2);
        assert_eq!(stats.allocated_large.get(), 0);
        assert_eq!(stats.used_large.get(), 0);
        assert_eq!(stats.live_large_blocks.get(), 0);
        assert!(metadata.owned_blocks(BlockType::Large).is_empty());

        // Safety: Test code.
        assert_eq!(unsafe { release_leaked(&metadata, &stats) }, 0);
    }
}
