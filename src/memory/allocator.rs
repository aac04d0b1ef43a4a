use super::block_info::{BlockType, DEFAULT_ADDRESS_BITS, MetadataTable};
use super::error::MemoryError;
use super::fixed::{FixedBlockTable, SizeClassReport};
use super::large;
use super::platform::{PAGE_ALLOCATION_SIZE, PlatformMemory, PlatformOps};
use super::size_class::{
    DEFAULT_ALIGNMENT, FIXED_CLASS_COUNT, FIXED_CLASSES, align_size, class_info,
    fixed_size_to_table_index, is_fixed_size,
};
use super::stats::{AllocatorStats, MemoryStats};
use crate::sync::atomic::{AtomicU8, Ordering};
use std::ptr::NonNull;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// Configuration for [`Allocator`]. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Fill freed fixed blocks and released pools with
    /// [`POISON_PATTERN`](super::fixed::POISON_PATTERN).
    /// Default: on in debug builds.
    pub poison_fill: bool,

    /// Width of the user address space covered by the block info table.
    /// Every platform allocation must lie below `1 << address_bits`.
    /// Default: [`DEFAULT_ADDRESS_BITS`] (48).
    pub address_bits: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            poison_fill: cfg!(debug_assertions),
            address_bits: DEFAULT_ADDRESS_BITS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Fixed(usize),
    Large,
}

/// Route a request: aligned sizes up to the largest class go to the fixed
/// path, everything else to the large path. Size 0 is the smallest class.
fn route(size: usize) -> Result<Route, MemoryError> {
    let aligned = align_size(size).ok_or(MemoryError::SizeOverflow { size })?;
    if aligned == 0 {
        return Ok(Route::Fixed(0));
    }
    if is_fixed_size(aligned) {
        Ok(Route::Fixed(usize::from(fixed_size_to_table_index(aligned))))
    } else {
        Ok(Route::Large)
    }
}

/// Routes allocations between the fixed-size pools and the large block path,
/// and owns the lifecycle of both.
///
/// Lifecycle: `Uninitialized → Initialized → Uninitialized`. Allocating,
/// freeing or reallocating outside `Initialized` panics.
///
/// Dropping the allocator returns every leaked block to the platform, large
/// blocks included.
pub struct Allocator {
    config: AllocatorConfig,
    state: AtomicU8,
    metadata: MetadataTable,
    fixed: FixedBlockTable,
    stats: AllocatorStats,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

impl Allocator {
    /// # Panics
    /// Panics if `config.address_bits` is outside the supported range.
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(UNINITIALIZED),
            metadata: MetadataTable::new(config.address_bits),
            fixed: FixedBlockTable::new(config.poison_fill),
            stats: AllocatorStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }

    #[inline]
    #[track_caller]
    fn assert_initialized(&self) {
        assert!(self.is_initialized(), "memory allocator used while uninitialized");
    }

    /// Prepare the block info table. Must precede every allocation.
    ///
    /// # Panics
    /// Panics if the allocator is already initialized.
    pub fn initialize(&self) -> Result<(), MemoryError> {
        assert!(
            self.state
                .compare_exchange(UNINITIALIZED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "memory allocator initialized twice"
        );

        if let Err(e) = self.metadata.prepare() {
            self.state.store(UNINITIALIZED, Ordering::Release);
            return Err(e);
        }

        let info = PlatformMemory::memory_info();
        tracing::debug!(
            page_size = info.page_size,
            allocation_granularity = info.allocation_granularity,
            total_physical = info.total_physical,
            address_bits = self.config.address_bits,
            poison_fill = self.config.poison_fill,
            "memory allocator initialized"
        );
        for (index, class) in FIXED_CLASSES.iter().enumerate() {
            tracing::trace!(
                class = index,
                block_size = class.block_size,
                blocks_per_pool = class.blocks_per_pool,
                "fixed size class"
            );
        }

        self.state.store(INITIALIZED, Ordering::Release);
        Ok(())
    }

    /// Report final statistics and return to `Uninitialized`.
    ///
    /// Outstanding allocations are logged as a leak, not treated as an error.
    /// The block info table is released only when nothing is outstanding;
    /// otherwise it stays so leaked blocks can still be freed after a later
    /// `initialize()`.
    ///
    /// # Panics
    /// Panics if the allocator is not initialized.
    pub fn deinitialize(&self) -> MemoryStats {
        assert!(
            self.state
                .compare_exchange(INITIALIZED, UNINITIALIZED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "memory allocator deinitialized while uninitialized"
        );

        let stats = self.stats.snapshot();
        tracing::info!(
            allocated_fixed = stats.allocated_fixed,
            used_fixed = stats.used_fixed,
            allocated_large = stats.allocated_large,
            used_large = stats.used_large,
            pools = stats.pool_count,
            metadata_buckets = self.metadata.live_buckets(),
            "memory allocator deinitialized"
        );

        if stats.outstanding_bytes() > 0 {
            tracing::warn!(
                outstanding_bytes = stats.outstanding_bytes(),
                live_fixed_blocks = stats.live_fixed_blocks,
                live_large_blocks = stats.live_large_blocks,
                "memory leaked at deinitialization"
            );
        } else {
            // Safety: the state is Uninitialized, so no entry point reaches the
            // table, and nothing outstanding refers to it.
            unsafe { self.metadata.release_all() };
        }
        stats
    }

    /// Allocate `size` bytes aligned to [`DEFAULT_ALIGNMENT`].
    ///
    /// # Panics
    /// Panics if the allocator is not initialized.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        self.assert_initialized();
        match route(size)? {
            Route::Fixed(class_index) => self.fixed.allocate(class_index, &self.metadata, &self.stats),
            Route::Large => large::allocate(size, DEFAULT_ALIGNMENT, &self.metadata, &self.stats),
        }
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// Alignments up to [`DEFAULT_ALIGNMENT`] behave like [`malloc`](Self::malloc).
    /// Larger ones, up to [`PAGE_ALLOCATION_SIZE`], are served by the large path.
    pub fn malloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, MemoryError> {
        if !alignment.is_power_of_two() || alignment > PAGE_ALLOCATION_SIZE {
            return Err(MemoryError::UnsupportedAlignment { alignment });
        }
        if alignment <= DEFAULT_ALIGNMENT {
            return self.malloc(size);
        }
        self.assert_initialized();
        large::allocate(size, alignment, &self.metadata, &self.stats)
    }

    /// Return a block to the path that produced it.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed since.
    ///
    /// # Panics
    /// Panics if the allocator is not initialized, and (checked builds) on
    /// double free or a pointer this allocator does not own.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.assert_initialized();
        match self.metadata.find_existing(ptr).block_type() {
            // Safety: upheld by caller.
            BlockType::FixedSmall => unsafe { self.fixed.free(ptr, &self.metadata, &self.stats) },
            // Safety: upheld by caller.
            BlockType::Large => unsafe { large::free(ptr, &self.metadata, &self.stats) },
            BlockType::Untyped => panic!("free of {ptr:p}: not allocated by this allocator"),
        }
    }

    /// Usable bytes of a live block: its class size or its reserved large size.
    ///
    /// # Safety
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.assert_initialized();
        match self.metadata.find_existing(ptr).block_type() {
            // Safety: upheld by caller.
            BlockType::FixedSmall => class_info(unsafe { FixedBlockTable::class_of(ptr) }).block_size,
            BlockType::Large => large::block_size(ptr, &self.metadata),
            BlockType::Untyped => panic!("usable_size of {ptr:p}: not allocated by this allocator"),
        }
    }

    /// Resize a block.
    ///
    /// Keeps `ptr` when `new_size` maps to the same size class (fixed blocks)
    /// or to the same reserved size (large blocks). Otherwise allocates a new
    /// block, copies `min(old usable size, new_size)` bytes and frees `ptr`.
    /// A moved block has [`DEFAULT_ALIGNMENT`].
    ///
    /// On error `ptr` is left untouched.
    ///
    /// # Safety
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
        self.assert_initialized();
        let target = route(new_size)?;
        let old_usable = match self.metadata.find_existing(ptr).block_type() {
            BlockType::FixedSmall => {
                // Safety: upheld by caller.
                let class_index = unsafe { FixedBlockTable::class_of(ptr) };
                if target == Route::Fixed(class_index) {
                    return Ok(ptr);
                }
                class_info(class_index).block_size
            }
            BlockType::Large => {
                let reserved = large::block_size(ptr, &self.metadata);
                if target == Route::Large
                    && large::large_block_size(new_size, DEFAULT_ALIGNMENT) == Some(reserved)
                {
                    return Ok(ptr);
                }
                reserved
            }
            BlockType::Untyped => panic!("realloc of {ptr:p}: not allocated by this allocator"),
        };

        let moved = self.malloc(new_size)?;
        // Safety: distinct live blocks; both hold at least the copied length.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_usable.min(new_size));
            self.free(ptr);
        }
        Ok(moved)
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.stats.snapshot()
    }

    /// Check the pool invariants of one size class.
    ///
    /// # Panics
    /// Panics on a violated invariant or an out-of-range class.
    #[must_use]
    pub fn class_report(&self, class_index: usize) -> SizeClassReport {
        self.fixed.validate_class(class_index)
    }

    /// Check every size class. See [`class_report`](Self::class_report).
    #[must_use]
    pub fn validate(&self) -> Vec<SizeClassReport> {
        (0..FIXED_CLASS_COUNT).map(|i| self.fixed.validate_class(i)).collect()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        // Leaked pools go with the fixed table; leaked large blocks are only
        // reachable through the block info table, so walk it first.
        // Safety: &mut self, no block of this allocator can be used anymore.
        let released = unsafe { large::release_leaked(&self.metadata, &self.stats) };
        if released > 0 {
            tracing::warn!(blocks = released, "released leaked large blocks on allocator drop");
        }
    }
}
