#[cfg(not(target_pointer_width = "64"))]
compile_error!("musa-memory supports only 64-bit targets.");

/// `assert!` that the `unchecked` feature compiles out. Guards memory
/// integrity checks (freed-block tags, double free, metadata ownership).
macro_rules! integrity_assert {
    ($($arg:tt)*) => {
        if cfg!(not(feature = "unchecked")) {
            assert!($($arg)*);
        }
    };
}

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::allocator::{Allocator, AllocatorConfig};
pub use memory::fixed::{POISON_PATTERN, SizeClassReport};

// process-wide lifecycle
#[cfg(not(loom))]
pub use memory::manager::{
    deinitialize_memory, free, initialize_memory, initialize_memory_with, is_memory_initialized,
    malloc, memory_stats, realloc,
};

// sizes and metadata
pub use memory::block_info::{BlockType, DEFAULT_ADDRESS_BITS, MAX_ADDRESS_BITS, split_address};
pub use memory::platform::{BITS_IN_PAGE_ALLOCATION, PAGE_ALLOCATION_SIZE, PlatformMemoryInfo};
pub use memory::size_class::{
    DEFAULT_ALIGNMENT, FIXED_CLASS_COUNT, MAX_FIXED_SIZE, SIZE_CLASSES, align_size,
    fixed_size_to_table_index,
};

// stats and errors
pub use memory::error::MemoryError;
pub use memory::stats::MemoryStats;
