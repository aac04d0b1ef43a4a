use super::error::MemoryError;
use std::io;
use std::ptr::NonNull;

/// Size and alignment of every platform allocation: pool extents, metadata
/// buckets and the granularity of large blocks.
pub const PAGE_ALLOCATION_SIZE: usize = 64 * 1024;
pub const BITS_IN_PAGE_ALLOCATION: u32 = 16;

const _: () = assert!(1usize << BITS_IN_PAGE_ALLOCATION == PAGE_ALLOCATION_SIZE);

/// What the host reports about its memory. Queried once at initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformMemoryInfo {
    /// OS page size (default/minimum).
    pub page_size: usize,
    /// Size and alignment of every block this crate requests from the OS.
    pub allocation_granularity: usize,
    /// Installed physical memory, when the platform exposes it.
    pub total_physical: Option<usize>,
}

/// Abstract interface over the OS page allocator.
pub(crate) trait PlatformOps {
    /// Allocate `size` zero-filled, readable and writable bytes aligned to
    /// [`PAGE_ALLOCATION_SIZE`].
    ///
    /// `size` must be a non-zero multiple of [`PAGE_ALLOCATION_SIZE`].
    fn alloc(size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Return a range obtained from [`alloc`](Self::alloc) to the OS.
    ///
    /// # Safety
    /// `ptr`/`size` must describe exactly one live allocation from `alloc`;
    /// the range must not be accessed afterwards.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    fn memory_info() -> PlatformMemoryInfo;
}

pub(crate) struct PlatformMemory;

fn check_request(size: usize) -> Result<(), MemoryError> {
    if size == 0 || !size.is_multiple_of(PAGE_ALLOCATION_SIZE) {
        return Err(MemoryError::PlatformAlloc(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("platform allocation of {size} bytes is not a non-zero multiple of {PAGE_ALLOCATION_SIZE}"),
        )));
    }
    Ok(())
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{
        MemoryError, NonNull, PAGE_ALLOCATION_SIZE, PlatformMemory, PlatformMemoryInfo,
        PlatformOps, check_request,
    };
    use std::io;

    /// Reserve address space without access rights.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::PlatformAlloc(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| MemoryError::PlatformAlloc(io::Error::other("mmap returned null")))
    }

    /// Back a reserved range with readable/writable pages.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        // Safety: FFI call to mprotect.
        if unsafe {
            libc::mprotect(
                ptr.as_ptr().cast::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        } != 0
        {
            return Err(MemoryError::PlatformAlloc(io::Error::last_os_error()));
        }
        Ok(())
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl PlatformOps for PlatformMemory {
        fn alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
            check_request(size)?;
            debug_assert!(
                PAGE_ALLOCATION_SIZE.is_multiple_of(Self::page_size()),
                "page allocation size {PAGE_ALLOCATION_SIZE} is not a multiple of the OS page size {}",
                Self::page_size()
            );

            // mmap only guarantees OS-page alignment. Over-reserve by one
            // granule, then hand the unaligned head and tail back.
            let padded = size
                .checked_add(PAGE_ALLOCATION_SIZE)
                .ok_or(MemoryError::SizeOverflow { size })?;
            // Safety: FFI call to reserve memory.
            let base = unsafe { reserve(padded)? };
            let base_addr = base.as_ptr() as usize;
            let head = base_addr.next_multiple_of(PAGE_ALLOCATION_SIZE) - base_addr;
            let tail = padded - head - size;

            // Safety: head < padded, the result stays inside the reservation.
            let aligned = unsafe { NonNull::new_unchecked(base.as_ptr().add(head)) };
            // Safety: aligned + size <= base + padded.
            let tail_ptr = unsafe { NonNull::new_unchecked(aligned.as_ptr().add(size)) };

            // Safety: the trimmed ranges belong to the reservation made above
            // and are page-aligned because both mmap and the granule are.
            let trimmed = unsafe {
                (if head != 0 { unmap(base, head) } else { Ok(()) })
                    .and_then(|()| if tail != 0 { unmap(tail_ptr, tail) } else { Ok(()) })
            };
            if let Err(e) = trimmed {
                // Safety: unmapping a partially unmapped range is allowed.
                drop(unsafe { unmap(base, padded) });
                return Err(MemoryError::PlatformAlloc(e));
            }

            // Safety: aligned..aligned+size is the surviving reservation.
            if let Err(e) = unsafe { commit(aligned, size) } {
                // Safety: same range as above.
                drop(unsafe { unmap(aligned, size) });
                return Err(e);
            }

            Ok(aligned)
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // Safety: upheld by caller.
            unsafe { unmap(ptr, size) }.map_err(MemoryError::PlatformRelease)
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // this crate supports only 64-bit targets; page size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn memory_info() -> PlatformMemoryInfo {
            // Safety: FFI call to sysconf.
            let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let total_physical = (pages > 0)
                .then(|| (pages as usize).checked_mul(Self::page_size()))
                .flatten();
            PlatformMemoryInfo {
                page_size: Self::page_size(),
                allocation_granularity: PAGE_ALLOCATION_SIZE,
                total_physical,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed PlatformOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Miri does not model mmap either.
// Every "page allocation" is a plain zeroed heap allocation with the granule
// as its alignment, which also serves targets without a native backend.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
impl PlatformOps for PlatformMemory {
    fn alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        check_request(size)?;
        let layout = std::alloc::Layout::from_size_align(size, PAGE_ALLOCATION_SIZE)
            .map_err(|e| MemoryError::PlatformAlloc(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemoryError::PlatformAlloc(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, PAGE_ALLOCATION_SIZE)
            .map_err(|e| MemoryError::PlatformRelease(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `alloc`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn memory_info() -> PlatformMemoryInfo {
        PlatformMemoryInfo {
            page_size: Self::page_size(),
            allocation_granularity: PAGE_ALLOCATION_SIZE,
            total_physical: None,
        }
    }
}
