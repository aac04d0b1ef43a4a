//! Process-wide allocator.
//!
//! The rest of the engine allocates through these free functions, which are
//! valid only between [`initialize_memory`] and [`deinitialize_memory`].

use super::allocator::{Allocator, AllocatorConfig};
use super::error::MemoryError;
use super::size_class::DEFAULT_ALIGNMENT;
use super::stats::MemoryStats;
use crate::sync::OnceLock;
use std::alloc::{Layout, handle_alloc_error};
use std::ptr::NonNull;

static GLOBAL: OnceLock<Allocator> = OnceLock::new();

#[track_caller]
fn global() -> &'static Allocator {
    let Some(allocator) = GLOBAL.get() else {
        panic!("memory allocator used before initialize_memory()");
    };
    allocator
}

/// Initialize the process allocator with the default configuration.
///
/// # Panics
/// Panics if memory is already initialized.
pub fn initialize_memory() -> Result<(), MemoryError> {
    initialize_memory_with(AllocatorConfig::default())
}

/// Initialize the process allocator.
///
/// The configuration is fixed by the first call; a later re-initialization
/// (after [`deinitialize_memory`]) keeps it.
pub fn initialize_memory_with(config: AllocatorConfig) -> Result<(), MemoryError> {
    let allocator = GLOBAL.get_or_init(|| Allocator::new(config));
    if allocator.config() != config {
        tracing::warn!(
            requested = ?config,
            active = ?allocator.config(),
            "memory re-initialized with a different configuration; keeping the first one"
        );
    }
    allocator.initialize()
}

/// Tear the process allocator down and return its final statistics.
/// Outstanding allocations are reported as leaks.
///
/// # Panics
/// Panics if memory is not initialized.
pub fn deinitialize_memory() -> MemoryStats {
    global().deinitialize()
}

#[must_use]
pub fn is_memory_initialized() -> bool {
    GLOBAL.get().is_some_and(Allocator::is_initialized)
}

#[cold]
fn allocation_failed(size: usize, error: &MemoryError) -> ! {
    tracing::error!(size, %error, "out of memory");
    match Layout::from_size_align(size.max(1), DEFAULT_ALIGNMENT) {
        Ok(layout) => handle_alloc_error(layout),
        Err(_) => panic!("allocation of {size} bytes failed: {error}"),
    }
}

/// Allocate `size` bytes aligned to 16. Running out of memory is fatal.
///
/// # Panics
/// Panics if memory is not initialized.
#[must_use]
pub fn malloc(size: usize) -> NonNull<u8> {
    global()
        .malloc(size)
        .unwrap_or_else(|e| allocation_failed(size, &e))
}

/// Free a block returned by [`malloc`] or [`realloc`].
///
/// # Safety
/// `ptr` must be live and owned by the process allocator.
pub unsafe fn free(ptr: NonNull<u8>) {
    // Safety: upheld by caller.
    unsafe { global().free(ptr) };
}

/// Resize a block, preserving its content up to the smaller size.
///
/// # Safety
/// `ptr` must be live and owned by the process allocator. It is invalid
/// afterwards unless it is the returned pointer.
#[must_use]
pub unsafe fn realloc(ptr: NonNull<u8>, new_size: usize) -> NonNull<u8> {
    // Safety: upheld by caller.
    unsafe { global().realloc(ptr, new_size) }.unwrap_or_else(|e| allocation_failed(new_size, &e))
}

/// Current statistics of the process allocator.
///
/// # Panics
/// Panics if memory was never initialized.
#[must_use]
pub fn memory_stats() -> MemoryStats {
    global().stats()
}
