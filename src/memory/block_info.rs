//! Sharded address → block bookkeeping table.
//!
//! Every [`PAGE_ALLOCATION_SIZE`] granule of address space owns one
//! [`MemoryBlockInfo`] record. Records are grouped into buckets of
//! [`RECORDS_PER_BUCKET`]; a bucket's backing memory is a single platform
//! allocation made on first touch, so untouched address space costs nothing
//! beyond its (zeroed) slot in the bucket pointer array.
//!
//! ```text
//!   address: | bucket (bucket_bits) | slot (12 bits) | offset (16 bits) |
//! ```
//!
//! First touch of a bucket is published with a compare-and-swap on its slot;
//! a thread that loses the race releases its own allocation and uses the
//! winner's.

use super::error::MemoryError;
use super::platform::{BITS_IN_PAGE_ALLOCATION, PAGE_ALLOCATION_SIZE, PlatformMemory, PlatformOps};
use crate::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::ptr::NonNull;

pub const BITS_OF_BLOCK_INFO_MASK: u32 = 12;
pub const RECORDS_PER_BUCKET: usize = 1 << BITS_OF_BLOCK_INFO_MASK;
const BLOCK_INFO_MASK: usize = RECORDS_PER_BUCKET - 1;

/// Bytes of platform memory backing one bucket.
const BUCKET_BYTES: usize =
    (RECORDS_PER_BUCKET * size_of::<MemoryBlockInfo>()).next_multiple_of(PAGE_ALLOCATION_SIZE);

/// Default user address space width covered by the table: the 48-bit user
/// range of x86_64 and of aarch64 with 4-level tables. The slot array is
/// lazily backed, so the 8 MiB it spans costs only the pages touched.
pub const DEFAULT_ADDRESS_BITS: u32 = 48;
/// Widest supported address space (52-bit VA kernels).
pub const MAX_ADDRESS_BITS: u32 = 52;
const MIN_ADDRESS_BITS: u32 = BITS_IN_PAGE_ALLOCATION + BITS_OF_BLOCK_INFO_MASK + 1;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Untyped = 0,
    FixedSmall = 1,
    Large = 2,
}

impl BlockType {
    #[inline]
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Untyped,
            1 => Self::FixedSmall,
            2 => Self::Large,
            _ => panic!("corrupted block info: type tag {raw}"),
        }
    }
}

/// Bookkeeping for one granule. All fields are atomics: records that share a
/// bucket are written by whichever thread owns the granule they describe.
#[repr(C, align(16))]
pub struct MemoryBlockInfo {
    allocated_size: AtomicUsize,
    block_type: AtomicU8,
    owned: AtomicU8,
}

impl MemoryBlockInfo {
    fn new() -> Self {
        Self {
            allocated_size: AtomicUsize::new(0),
            block_type: AtomicU8::new(BlockType::Untyped as u8),
            owned: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn allocated_size(&self) -> usize {
        self.allocated_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_allocated_size(&self, size: usize) {
        self.allocated_size.store(size, Ordering::Release);
    }

    #[inline]
    pub fn block_type(&self) -> BlockType {
        BlockType::from_raw(self.block_type.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire) != 0
    }
}

/// Split an address into `(bucket_index, slot_index)`.
///
/// Pure function of the address; the caller guarantees the address fits in
/// `BITS_IN_PAGE_ALLOCATION + BITS_OF_BLOCK_INFO_MASK + bucket_bits` bits.
#[inline]
#[must_use]
pub fn split_address(address: usize, bucket_bits: u32) -> (usize, usize) {
    let granule = address >> BITS_IN_PAGE_ALLOCATION;
    let slot = granule & BLOCK_INFO_MASK;
    let bucket = (granule >> BITS_OF_BLOCK_INFO_MASK) & ((1usize << bucket_bits) - 1);
    (bucket, slot)
}

pub(crate) struct MetadataTable {
    /// Bucket pointer array, allocated by `prepare()`. Null until then.
    slots: AtomicPtr<AtomicPtr<MemoryBlockInfo>>,
    address_bits: u32,
    live_buckets: AtomicUsize,
}

// Safety: all shared state is reached through atomics; bucket memory is owned
// by the table until `release_all()`.
unsafe impl Send for MetadataTable {}
// Safety: see above.
unsafe impl Sync for MetadataTable {}

impl MetadataTable {
    /// # Panics
    /// Panics if `address_bits` is outside the supported range.
    pub fn new(address_bits: u32) -> Self {
        assert!(
            (MIN_ADDRESS_BITS..=MAX_ADDRESS_BITS).contains(&address_bits),
            "address_bits {address_bits} outside {MIN_ADDRESS_BITS}..={MAX_ADDRESS_BITS}"
        );
        Self {
            slots: AtomicPtr::new(std::ptr::null_mut()),
            address_bits,
            live_buckets: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn bucket_bits(&self) -> u32 {
        self.address_bits - BITS_IN_PAGE_ALLOCATION - BITS_OF_BLOCK_INFO_MASK
    }

    #[inline]
    fn slot_count(&self) -> usize {
        1 << self.bucket_bits()
    }

    fn slot_array_bytes(&self) -> usize {
        (self.slot_count() * size_of::<AtomicPtr<MemoryBlockInfo>>())
            .next_multiple_of(PAGE_ALLOCATION_SIZE)
    }

    pub fn is_prepared(&self) -> bool {
        !self.slots.load(Ordering::Acquire).is_null()
    }

    /// Number of buckets whose backing memory has been allocated.
    pub fn live_buckets(&self) -> usize {
        self.live_buckets.load(Ordering::Relaxed)
    }

    /// Allocate the bucket pointer array. Bucket contents stay lazy.
    /// No-op if already prepared.
    pub fn prepare(&self) -> Result<(), MemoryError> {
        if self.is_prepared() {
            return Ok(());
        }
        let slots = PlatformMemory::alloc(self.slot_array_bytes())?
            .cast::<AtomicPtr<MemoryBlockInfo>>();
        // Platform memory is zero-filled, and a zeroed std AtomicPtr is null.
        // loom's atomics must be constructed.
        #[cfg(loom)]
        for i in 0..self.slot_count() {
            // Safety: i < slot_count, inside the allocation.
            unsafe { slots.as_ptr().add(i).write(AtomicPtr::new(std::ptr::null_mut())) };
        }
        if self
            .slots
            .compare_exchange(std::ptr::null_mut(), slots.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Safety: never published.
            unsafe { self.release_slot_array(slots) };
        }
        Ok(())
    }

    #[inline]
    fn slots(&self) -> &[AtomicPtr<MemoryBlockInfo>] {
        let slots = self.slots.load(Ordering::Acquire);
        assert!(!slots.is_null(), "memory block info table used before initialization");
        // Safety: prepared slot arrays hold slot_count() initialised entries
        // and stay alive until release_all().
        unsafe { std::slice::from_raw_parts(slots, self.slot_count()) }
    }

    #[inline]
    fn locate(&self, address: usize) -> (usize, usize) {
        assert!(
            address >> self.address_bits == 0,
            "address {address:#x} is outside the {}-bit range covered by the block info table",
            self.address_bits
        );
        split_address(address, self.bucket_bits())
    }

    fn get_or_create_bucket(&self, bucket_index: usize) -> Result<NonNull<MemoryBlockInfo>, MemoryError> {
        let slot = &self.slots()[bucket_index];
        if let Some(bucket) = NonNull::new(slot.load(Ordering::Acquire)) {
            return Ok(bucket);
        }

        let fresh = PlatformMemory::alloc(BUCKET_BYTES)?.cast::<MemoryBlockInfo>();
        for i in 0..RECORDS_PER_BUCKET {
            // Safety: i < RECORDS_PER_BUCKET, inside the BUCKET_BYTES allocation.
            unsafe { fresh.as_ptr().add(i).write(MemoryBlockInfo::new()) };
        }

        match slot.compare_exchange(
            std::ptr::null_mut(),
            fresh.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.live_buckets.fetch_add(1, Ordering::Relaxed);
                Ok(fresh)
            }
            Err(winner) => {
                // Safety: `fresh` was never published.
                unsafe { release_bucket(fresh) };
                // Safety: CAS failure means the slot holds a non-null bucket.
                Ok(unsafe { NonNull::new_unchecked(winner) })
            }
        }
    }

    /// Resolve the record for `address`, allocating its bucket on first touch.
    ///
    /// Marks the record owned and adopts `block_type` if the record is untyped.
    ///
    /// # Panics
    /// Panics if the record already carries a different type (it was not
    /// deinitialized after its previous occupant), or if `address` is outside
    /// the covered range.
    pub fn initialize_or_find(
        &self,
        address: NonNull<u8>,
        block_type: BlockType,
    ) -> Result<&MemoryBlockInfo, MemoryError> {
        debug_assert!(block_type != BlockType::Untyped);
        let (bucket_index, slot_index) = self.locate(address.as_ptr() as usize);
        let bucket = self.get_or_create_bucket(bucket_index)?;
        // Safety: slot_index < RECORDS_PER_BUCKET; bucket lives until release_all().
        let info = unsafe { &*bucket.as_ptr().add(slot_index) };

        info.owned.store(1, Ordering::Release);
        if let Err(existing) = info.block_type.compare_exchange(
            BlockType::Untyped as u8,
            block_type as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            integrity_assert!(
                existing == block_type as u8,
                "block info type mismatch at {address:p}: record is {:?}, adopting {block_type:?}",
                BlockType::from_raw(existing)
            );
        }
        Ok(info)
    }

    /// Resolve the record of a live allocation. Never allocates.
    ///
    /// # Panics
    /// Panics if the bucket does not exist, or (checked builds) if the record
    /// is not owned and typed.
    pub fn find_existing(&self, address: NonNull<u8>) -> &MemoryBlockInfo {
        let (bucket_index, slot_index) = self.locate(address.as_ptr() as usize);
        let bucket = self.slots()[bucket_index].load(Ordering::Acquire);
        assert!(
            !bucket.is_null(),
            "no block info bucket for {address:p}: pointer was not allocated by this allocator"
        );
        // Safety: slot_index < RECORDS_PER_BUCKET; bucket lives until release_all().
        let info = unsafe { &*bucket.add(slot_index) };
        integrity_assert!(info.is_owned(), "block info for {address:p} is not owned (double free or foreign pointer?)");
        integrity_assert!(info.block_type() != BlockType::Untyped, "block info for {address:p} is untyped");
        info
    }

    /// Reset a record after its occupant is released.
    pub fn deinitialize(&self, info: &MemoryBlockInfo) {
        info.allocated_size.store(0, Ordering::Relaxed);
        info.owned.store(0, Ordering::Relaxed);
        info.block_type.store(BlockType::Untyped as u8, Ordering::Release);
    }

    /// Start addresses of every owned record of `block_type`.
    ///
    /// Walks the published buckets only. Empty if the table is not prepared.
    pub fn owned_blocks(&self, block_type: BlockType) -> Vec<NonNull<u8>> {
        let slots = self.slots.load(Ordering::Acquire);
        if slots.is_null() {
            return Vec::new();
        }
        let mut found = Vec::new();
        for (bucket_index, slot) in self.slots().iter().enumerate() {
            let Some(bucket) = NonNull::new(slot.load(Ordering::Acquire)) else {
                continue;
            };
            for slot_index in 0..RECORDS_PER_BUCKET {
                // Safety: slot_index < RECORDS_PER_BUCKET; bucket lives until release_all().
                let info = unsafe { &*bucket.as_ptr().add(slot_index) };
                if !info.is_owned() || info.block_type() != block_type {
                    continue;
                }
                let granule = (bucket_index << BITS_OF_BLOCK_INFO_MASK) | slot_index;
                if let Some(address) = NonNull::new((granule << BITS_IN_PAGE_ALLOCATION) as *mut u8) {
                    found.push(address);
                }
            }
        }
        found
    }

    /// Free every bucket and the slot array.
    ///
    /// # Safety
    /// No other thread may use the table concurrently, and no reference
    /// returned by the lookup functions may be used afterwards.
    pub unsafe fn release_all(&self) {
        let slots = self.slots.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let Some(slots) = NonNull::new(slots) else {
            return;
        };
        for i in 0..self.slot_count() {
            // Safety: slots holds slot_count() initialised entries.
            let slot = unsafe { &*slots.as_ptr().add(i) };
            if let Some(bucket) = NonNull::new(slot.swap(std::ptr::null_mut(), Ordering::AcqRel)) {
                // Safety: bucket was published by get_or_create_bucket.
                unsafe { release_bucket(bucket) };
                self.live_buckets.fetch_sub(1, Ordering::Relaxed);
            }
        }
        // Safety: unpublished above.
        unsafe { self.release_slot_array(slots) };
    }

    unsafe fn release_slot_array(&self, slots: NonNull<AtomicPtr<MemoryBlockInfo>>) {
        #[cfg(loom)]
        for i in 0..self.slot_count() {
            // Safety: entry i was constructed in prepare().
            unsafe { std::ptr::drop_in_place(slots.as_ptr().add(i)) };
        }
        // Safety: slots came from PlatformMemory::alloc(slot_array_bytes()).
        if let Err(e) = unsafe { PlatformMemory::release(slots.cast(), self.slot_array_bytes()) } {
            tracing::warn!("failed to release block info slot array: {e}");
        }
    }
}

impl Drop for MetadataTable {
    fn drop(&mut self) {
        // Safety: &mut self, no outstanding borrows.
        unsafe { self.release_all() };
    }
}

unsafe fn release_bucket(bucket: NonNull<MemoryBlockInfo>) {
    for i in 0..RECORDS_PER_BUCKET {
        // Safety: every record was constructed before the bucket was used.
        unsafe { std::ptr::drop_in_place(bucket.as_ptr().add(i)) };
    }
    // Safety: bucket came from PlatformMemory::alloc(BUCKET_BYTES).
    if let Err(e) = unsafe { PlatformMemory::release(bucket.cast(), BUCKET_BYTES) } {
        tracing::warn!("failed to release block info bucket: {e}");
    }
}
