//! Allocator statistics.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent while other threads allocate (e.g. `used_fixed` may briefly
//! lead `live_fixed_blocks`). Once all threads touching an allocator have
//! been joined, a snapshot is exact.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Live counters of one allocator instance.
#[derive(Default)]
pub(crate) struct AllocatorStats {
    /// Pool bytes obtained from the platform for the fixed path.
    pub allocated_fixed: Counter,
    /// Block bytes currently handed out by the fixed path.
    pub used_fixed: Counter,
    /// Bytes obtained from the platform for large blocks.
    pub allocated_large: Counter,
    /// Bytes currently handed out by the large path. Equal to
    /// `allocated_large`: large blocks are never cached.
    pub used_large: Counter,
    pub live_fixed_blocks: Counter,
    pub live_large_blocks: Counter,
    pub pool_count: Counter,
}

impl AllocatorStats {
    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            allocated_fixed: self.allocated_fixed.get(),
            used_fixed: self.used_fixed.get(),
            allocated_large: self.allocated_large.get(),
            used_large: self.used_large.get(),
            live_fixed_blocks: self.live_fixed_blocks.get(),
            live_large_blocks: self.live_large_blocks.get(),
            pool_count: self.pool_count.get(),
        }
    }
}

/// Point-in-time copy of an allocator's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocated_fixed: usize,
    pub used_fixed: usize,
    pub allocated_large: usize,
    pub used_large: usize,
    pub live_fixed_blocks: usize,
    pub live_large_blocks: usize,
    pub pool_count: usize,
}

impl MemoryStats {
    /// Bytes still handed out to callers. Non-zero at teardown means a leak.
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.used_fixed + self.used_large
    }

    /// Bytes currently held from the platform on behalf of callers.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_fixed + self.allocated_large
    }
}
