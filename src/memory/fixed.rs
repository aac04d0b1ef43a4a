//! Fixed-size block pools.
//!
//! Each size class owns two intrusive lists of pools behind its own mutex:
//! `available` (at least one free block) and `empty` (no free block left).
//! A pool is one [`PAGE_ALLOCATION_SIZE`] platform allocation, aligned to its
//! size, laid out as:
//!
//! ```text
//!   +-------------+---------+---------+-----+---------+-------+
//!   | PoolHeader  | block 0 | block 1 | ... | block N | slack |
//!   +-------------+---------+---------+-----+---------+-------+
//!   0             64
//! ```
//!
//! Because pools are size-aligned, `ptr & !(PAGE_ALLOCATION_SIZE - 1)` recovers
//! the header (and with it the size class) of any block.
//!
//! Free blocks carry a [`FreedBlock`] header. A fresh pool is a single run
//! covering every block; allocation splits one block off the head run, and
//! each free pushes a run of one.

use super::block_info::{BlockType, MetadataTable};
use super::error::MemoryError;
use super::platform::{PAGE_ALLOCATION_SIZE, PlatformMemory, PlatformOps};
use super::size_class::{FIXED_CLASS_COUNT, FixedClassInfo, POOL_HEADER_SIZE, class_info};
use super::stats::AllocatorStats;
use crate::sync::{Mutex, lock};
use fixedbitset::FixedBitSet;
use std::ptr::{self, NonNull};

const POOL_TAG: u32 = 0x4D50_4F4C;
const FREED_BLOCK_TAG: u32 = 0xF8EE_B10C;

/// Written over freed blocks (and released pools) when poison fill is on.
pub const POISON_PATTERN: u32 = 0xDEAD_DEAD;

/// In-place header of a block sitting on a pool's free list.
#[repr(C)]
struct FreedBlock {
    next: *mut FreedBlock,
    tag: u32,
    class_index: u8,
    _reserved: u8,
    /// Contiguous free blocks starting at this one.
    run_count: u16,
}

const _: () = assert!(size_of::<FreedBlock>() == 16);

#[repr(C)]
struct PoolHeader {
    tag: u32,
    class_index: u8,
    blocks_in_use: u16,
    prev: *mut PoolHeader,
    next: *mut PoolHeader,
    free_head: *mut FreedBlock,
}

const _: () = assert!(size_of::<PoolHeader>() <= POOL_HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolList {
    Available,
    Empty,
}

/// Pool lists of one size class. Only touched with the class mutex held.
pub(crate) struct PoolLists {
    available: *mut PoolHeader,
    empty: *mut PoolHeader,
    pool_count: usize,
}

// Safety: the raw pointers are owned pool extents, only reached through the
// enclosing Mutex.
unsafe impl Send for PoolLists {}

impl PoolLists {
    fn new() -> Self {
        Self {
            available: ptr::null_mut(),
            empty: ptr::null_mut(),
            pool_count: 0,
        }
    }

    fn head_mut(&mut self, list: PoolList) -> &mut *mut PoolHeader {
        match list {
            PoolList::Available => &mut self.available,
            PoolList::Empty => &mut self.empty,
        }
    }

    /// # Safety
    /// `pool` must be a live pool header not linked into either list.
    unsafe fn push_front(&mut self, list: PoolList, pool: *mut PoolHeader) {
        let head = self.head_mut(list);
        // Safety: pool and *head (if non-null) are live headers owned by this class.
        unsafe {
            (*pool).prev = ptr::null_mut();
            (*pool).next = *head;
            if let Some(old) = (*head).as_mut() {
                old.prev = pool;
            }
        }
        *head = pool;
    }

    /// # Safety
    /// `pool` must be a live pool header linked into `list`.
    unsafe fn unlink(&mut self, list: PoolList, pool: *mut PoolHeader) {
        // Safety: pool and its neighbours are live headers owned by this class.
        unsafe {
            let prev = (*pool).prev;
            let next = (*pool).next;
            if let Some(p) = prev.as_mut() {
                p.next = next;
            } else {
                let head = self.head_mut(list);
                debug_assert!(ptr::eq(*head, pool), "pool {pool:p} is not the head of {list:?}");
                *head = next;
            }
            if let Some(n) = next.as_mut() {
                n.prev = prev;
            }
            (*pool).prev = ptr::null_mut();
            (*pool).next = ptr::null_mut();
        }
    }
}

/// Snapshot of one size class, produced by [`FixedBlockTable::validate_class`]
/// after its invariants were checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassReport {
    pub class_index: usize,
    pub block_size: usize,
    pub blocks_per_pool: usize,
    pub available_pools: usize,
    pub empty_pools: usize,
    pub blocks_in_use: usize,
    pub free_blocks: usize,
}

impl SizeClassReport {
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.available_pools + self.empty_pools
    }
}

#[inline]
fn pool_of(ptr: NonNull<u8>) -> *mut PoolHeader {
    ptr.as_ptr().map_addr(|a| a & !(PAGE_ALLOCATION_SIZE - 1)).cast()
}

#[inline]
unsafe fn block_at(pool: *mut PoolHeader, index: usize, block_size: usize) -> *mut u8 {
    // Safety: caller keeps index < blocks_per_pool, inside the pool extent.
    unsafe { pool.cast::<u8>().add(POOL_HEADER_SIZE + index * block_size) }
}

/// Fill `len` bytes with [`POISON_PATTERN`]. `len` is a multiple of 16.
unsafe fn poison(dst: *mut u8, len: usize) {
    let words = dst.cast::<u32>();
    for i in 0..len / size_of::<u32>() {
        // Safety: dst..dst+len is writable and 16-aligned.
        unsafe { words.add(i).write(POISON_PATTERN) };
    }
}

pub(crate) struct FixedBlockTable {
    classes: [Mutex<PoolLists>; FIXED_CLASS_COUNT],
    poison_fill: bool,
}

impl FixedBlockTable {
    pub fn new(poison_fill: bool) -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(PoolLists::new())),
            poison_fill,
        }
    }

    /// Carve a fresh pool for `class_index` and register it as a
    /// fixed-small block.
    fn create_pool(
        class_index: usize,
        info: FixedClassInfo,
        metadata: &MetadataTable,
    ) -> Result<*mut PoolHeader, MemoryError> {
        let extent = PlatformMemory::alloc(PAGE_ALLOCATION_SIZE)?;
        let block_info = match metadata.initialize_or_find(extent, BlockType::FixedSmall) {
            Ok(block_info) => block_info,
            Err(e) => {
                // Safety: extent was never handed out.
                drop(unsafe { PlatformMemory::release(extent, PAGE_ALLOCATION_SIZE) });
                return Err(e);
            }
        };
        block_info.set_allocated_size(info.block_size);

        let pool = extent.as_ptr().cast::<PoolHeader>();
        // Safety: extent is a fresh, writable, PAGE_ALLOCATION_SIZE-aligned allocation.
        unsafe {
            let first = block_at(pool, 0, info.block_size).cast::<FreedBlock>();
            first.write(FreedBlock {
                next: ptr::null_mut(),
                tag: FREED_BLOCK_TAG,
                class_index: class_index as u8,
                _reserved: 0,
                run_count: info.blocks_per_pool as u16,
            });
            pool.write(PoolHeader {
                tag: POOL_TAG,
                class_index: class_index as u8,
                blocks_in_use: 0,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                free_head: first,
            });
        }
        Ok(pool)
    }

    /// Pop one block off the pool's free list, splitting its head run.
    ///
    /// # Safety
    /// Class lock held; `pool` is a live pool of `class_index` with a free block.
    unsafe fn take_block(pool: *mut PoolHeader, class_index: usize, info: FixedClassInfo) -> NonNull<u8> {
        // Safety: upheld by caller.
        unsafe {
            let head = (*pool).free_head;
            assert!(!head.is_null(), "available pool {pool:p} has no free block");
            integrity_assert!(
                (*head).tag == FREED_BLOCK_TAG && usize::from((*head).class_index) == class_index,
                "corrupted freed block header at {head:p} (use after free?)"
            );

            let run = (*head).run_count;
            let next = (*head).next;
            if run > 1 {
                let rest = head.byte_add(info.block_size);
                rest.write(FreedBlock {
                    next,
                    tag: FREED_BLOCK_TAG,
                    class_index: class_index as u8,
                    _reserved: 0,
                    run_count: run - 1,
                });
                (*pool).free_head = rest;
            } else {
                (*pool).free_head = next;
            }
            (*pool).blocks_in_use += 1;

            // Hide the header from the caller.
            head.write_bytes(0, 1);
            NonNull::new_unchecked(head.cast())
        }
    }

    /// Allocate one block of `class_index`.
    pub fn allocate(
        &self,
        class_index: usize,
        metadata: &MetadataTable,
        stats: &AllocatorStats,
    ) -> Result<NonNull<u8>, MemoryError> {
        let info = class_info(class_index);
        let mut lists = lock(&self.classes[class_index]);

        if lists.available.is_null() {
            let pool = Self::create_pool(class_index, info, metadata)?;
            // Safety: fresh pool, not linked anywhere.
            unsafe { lists.push_front(PoolList::Available, pool) };
            lists.pool_count += 1;
            stats.allocated_fixed.add(PAGE_ALLOCATION_SIZE);
            stats.pool_count.add(1);
        }

        let pool = lists.available;
        // Safety: class lock held; pools on `available` have a free block.
        let block = unsafe { Self::take_block(pool, class_index, info) };

        // Safety: class lock held, pool is live and linked into `available`.
        if usize::from(unsafe { (*pool).blocks_in_use }) == info.blocks_per_pool {
            unsafe {
                lists.unlink(PoolList::Available, pool);
                lists.push_front(PoolList::Empty, pool);
            }
        }
        drop(lists);

        stats.used_fixed.add(info.block_size);
        stats.live_fixed_blocks.add(1);
        Ok(block)
    }

    /// Size class of a live fixed block, read from its pool header.
    ///
    /// # Safety
    /// `ptr` must point into a live pool of this table.
    pub unsafe fn class_of(ptr: NonNull<u8>) -> usize {
        let pool = pool_of(ptr);
        // Safety: tag and class are written once at pool creation; the pool
        // stays alive while the caller holds one of its blocks.
        let (tag, class_index) = unsafe { ((*pool).tag, usize::from((*pool).class_index)) };
        integrity_assert!(tag == POOL_TAG, "corrupted pool header for {ptr:p}: tag {tag:#x}");
        assert!(class_index < FIXED_CLASS_COUNT, "corrupted pool header for {ptr:p}: class {class_index}");
        class_index
    }

    /// True if `block` lies inside a run on `pool`'s free list.
    ///
    /// # Safety
    /// Class lock held; `pool` live.
    unsafe fn is_on_free_list(pool: *mut PoolHeader, block: *mut u8, block_size: usize) -> bool {
        // Safety: upheld by caller.
        unsafe {
            let mut node = (*pool).free_head;
            while !node.is_null() {
                let start = node as usize;
                let end = start + usize::from((*node).run_count) * block_size;
                if (start..end).contains(&(block as usize)) {
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }

    /// Return a block to its pool. Releases the pool when it becomes unused.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// table and not freed since.
    ///
    /// # Panics
    /// Checked builds panic on a corrupted pool header, a pointer that is not
    /// a block boundary, or a double free.
    pub unsafe fn free(&self, ptr: NonNull<u8>, metadata: &MetadataTable, stats: &AllocatorStats) {
        // Safety: upheld by caller.
        let class_index = unsafe { Self::class_of(ptr) };
        let info = class_info(class_index);
        let pool = pool_of(ptr);

        let offset = (ptr.as_ptr() as usize) - (pool as usize);
        integrity_assert!(
            offset >= POOL_HEADER_SIZE
                && (offset - POOL_HEADER_SIZE).is_multiple_of(info.block_size)
                && (offset - POOL_HEADER_SIZE) / info.block_size < info.blocks_per_pool,
            "pointer {ptr:p} is not a block of size class {} ({} bytes)",
            class_index,
            info.block_size
        );

        let block = ptr.as_ptr().cast::<FreedBlock>();
        let mut lists = lock(&self.classes[class_index]);

        // Safety: class lock held; the pool is live (the caller owns one of its blocks).
        unsafe {
            if cfg!(not(feature = "unchecked"))
                && (*block).tag == FREED_BLOCK_TAG
                && usize::from((*block).class_index) == class_index
            {
                assert!(
                    !Self::is_on_free_list(pool, ptr.as_ptr(), info.block_size),
                    "double free of {ptr:p} (size class {class_index})"
                );
            }

            if self.poison_fill {
                poison(ptr.as_ptr(), info.block_size);
            }
            block.write(FreedBlock {
                next: (*pool).free_head,
                tag: FREED_BLOCK_TAG,
                class_index: class_index as u8,
                _reserved: 0,
                run_count: 1,
            });
            (*pool).free_head = block;

            let was_full = usize::from((*pool).blocks_in_use) == info.blocks_per_pool;
            assert!((*pool).blocks_in_use > 0, "pool {pool:p} underflow");
            (*pool).blocks_in_use -= 1;

            if (*pool).blocks_in_use == 0 {
                let list = if was_full { PoolList::Empty } else { PoolList::Available };
                lists.unlink(list, pool);
                lists.pool_count -= 1;
                drop(lists);
                self.release_pool(pool, metadata, stats);
            } else {
                if was_full {
                    lists.unlink(PoolList::Empty, pool);
                    lists.push_front(PoolList::Available, pool);
                }
                drop(lists);
            }
        }

        stats.used_fixed.sub(info.block_size);
        stats.live_fixed_blocks.sub(1);
    }

    /// Hand an unlinked, unused pool back to the platform.
    ///
    /// The metadata record is reset *before* the extent is released so the
    /// granule is untyped by the time the OS can hand the address out again.
    unsafe fn release_pool(&self, pool: *mut PoolHeader, metadata: &MetadataTable, stats: &AllocatorStats) {
        // Safety: pool is a live extent start.
        let extent = unsafe { NonNull::new_unchecked(pool.cast::<u8>()) };
        let block_info = metadata.find_existing(extent);
        metadata.deinitialize(block_info);

        if self.poison_fill {
            // Safety: the pool is unlinked; nobody else can reach it.
            unsafe { poison(extent.as_ptr(), PAGE_ALLOCATION_SIZE) };
        }
        // Safety: extent came from PlatformMemory::alloc(PAGE_ALLOCATION_SIZE).
        if let Err(e) = unsafe { PlatformMemory::release(extent, PAGE_ALLOCATION_SIZE) } {
            tracing::warn!("failed to release pool {extent:p}: {e}");
        }
        stats.allocated_fixed.sub(PAGE_ALLOCATION_SIZE);
        stats.pool_count.sub(1);
    }

    /// Walk one class under its lock and check every pool invariant.
    ///
    /// # Panics
    /// Panics on the first violated invariant.
    pub fn validate_class(&self, class_index: usize) -> SizeClassReport {
        assert!(class_index < FIXED_CLASS_COUNT, "size class {class_index} out of range");
        let info = class_info(class_index);
        let lists = lock(&self.classes[class_index]);

        let mut report = SizeClassReport {
            class_index,
            block_size: info.block_size,
            blocks_per_pool: info.blocks_per_pool,
            available_pools: 0,
            empty_pools: 0,
            blocks_in_use: 0,
            free_blocks: 0,
        };
        let mut seen = FixedBitSet::with_capacity(info.blocks_per_pool);

        for list in [PoolList::Available, PoolList::Empty] {
            let mut prev: *mut PoolHeader = ptr::null_mut();
            let mut pool = match list {
                PoolList::Available => lists.available,
                PoolList::Empty => lists.empty,
            };
            while !pool.is_null() {
                // Safety: lock held; every linked pool is a live extent.
                let header = unsafe { &*pool };
                assert_eq!(header.tag, POOL_TAG, "pool {pool:p}: bad tag");
                assert_eq!(usize::from(header.class_index), class_index, "pool {pool:p}: wrong class");
                assert!(ptr::eq(header.prev, prev), "pool {pool:p}: broken prev link");

                let in_use = usize::from(header.blocks_in_use);
                assert!(in_use <= info.blocks_per_pool, "pool {pool:p}: {in_use} blocks in use");
                match list {
                    PoolList::Available => {
                        assert!(in_use < info.blocks_per_pool, "full pool {pool:p} on the available list");
                        assert!(in_use > 0, "unused pool {pool:p} was not released");
                        report.available_pools += 1;
                    }
                    PoolList::Empty => {
                        assert_eq!(in_use, info.blocks_per_pool, "pool {pool:p} with free blocks on the empty list");
                        report.empty_pools += 1;
                    }
                }

                seen.clear();
                let mut free = 0usize;
                let mut node = header.free_head;
                while !node.is_null() {
                    // Safety: free-list nodes live inside the pool.
                    let freed = unsafe { &*node };
                    assert_eq!(freed.tag, FREED_BLOCK_TAG, "pool {pool:p}: freed block {node:p} has a bad tag");
                    assert_eq!(usize::from(freed.class_index), class_index, "freed block {node:p}: wrong class");
                    assert!(freed.run_count > 0, "freed block {node:p}: empty run");
                    let offset = node as usize - pool as usize - POOL_HEADER_SIZE;
                    assert!(offset.is_multiple_of(info.block_size), "freed block {node:p} misaligned");
                    let first = offset / info.block_size;
                    let run = usize::from(freed.run_count);
                    assert!(first + run <= info.blocks_per_pool, "freed run at {node:p} overruns its pool");
                    for index in first..first + run {
                        assert!(!seen.put(index), "block {index} of pool {pool:p} is on the free list twice");
                    }
                    free += run;
                    node = freed.next;
                }
                assert_eq!(
                    free,
                    info.blocks_per_pool - in_use,
                    "pool {pool:p}: free list length disagrees with blocks in use"
                );

                report.blocks_in_use += in_use;
                report.free_blocks += free;
                prev = pool;
                pool = header.next;
            }
        }

        assert_eq!(report.pool_count(), lists.pool_count, "class {class_index}: pool count drifted");
        report
    }
}

impl Drop for FixedBlockTable {
    fn drop(&mut self) {
        // Remaining pools belong to leaked blocks; the table is going away,
        // so the extents go with it.
        for class in &self.classes {
            let mut lists = lock(class);
            for head in [lists.available, lists.empty] {
                let mut pool = head;
                while let Some(extent) = NonNull::new(pool) {
                    // Safety: linked pools are live extents.
                    pool = unsafe { (*pool).next };
                    // Safety: extent came from PlatformMemory::alloc(PAGE_ALLOCATION_SIZE).
                    drop(unsafe { PlatformMemory::release(extent.cast(), PAGE_ALLOCATION_SIZE) });
                }
            }
            *lists = PoolLists::new();
        }
    }
}
