use super::platform::PAGE_ALLOCATION_SIZE;

/// Alignment of every fixed block. Request sizes are rounded up to it.
pub const DEFAULT_ALIGNMENT: usize = 16;
pub const BITS_FOR_DEFAULT_ALIGNMENT: u32 = 4;

/// Largest request serviced by the fixed-size path.
pub const MAX_FIXED_SIZE: usize = 4096;

/// In-band pool control structure at the start of every pool extent.
pub(crate) const POOL_HEADER_SIZE: usize = 64;

pub const FIXED_CLASS_COUNT: usize = 28;

// 28 size classes: 16B..128B (step 16), then four steps per doubling up to 4KB
pub const SIZE_CLASSES: [usize; FIXED_CLASS_COUNT] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096,
];

const _: () = assert!(1usize << BITS_FOR_DEFAULT_ALIGNMENT == DEFAULT_ALIGNMENT);
const _: () = assert!(SIZE_CLASSES[FIXED_CLASS_COUNT - 1] == MAX_FIXED_SIZE);
const _: () = assert!(POOL_HEADER_SIZE.is_multiple_of(DEFAULT_ALIGNMENT));

/// Number of 16-byte quanta covered by the lookup cache (index 0 unused).
const FIXED_SIZE_CACHE_COUNT: usize = (MAX_FIXED_SIZE >> BITS_FOR_DEFAULT_ALIGNMENT) + 1;

/// Static description of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedClassInfo {
    pub block_size: usize,
    pub blocks_per_pool: usize,
}

pub(crate) const FIXED_CLASSES: [FixedClassInfo; FIXED_CLASS_COUNT] = build_class_table();

/// O(1) size-to-class lookup table. Index by `ceil(size / 16)`.
/// Each entry is the smallest class whose block size satisfies the quantum.
static FIXED_SIZE_TO_INDEX: [u8; FIXED_SIZE_CACHE_COUNT] = build_size_class_cache();

const fn build_class_table() -> [FixedClassInfo; FIXED_CLASS_COUNT] {
    let mut table = [FixedClassInfo { block_size: 0, blocks_per_pool: 0 }; FIXED_CLASS_COUNT];
    let mut i = 0;
    while i < FIXED_CLASS_COUNT {
        let block_size = SIZE_CLASSES[i];
        assert!(block_size.is_multiple_of(DEFAULT_ALIGNMENT));
        // Freed-block headers are 16 bytes; a run count must fit in u16.
        let blocks_per_pool = (PAGE_ALLOCATION_SIZE - POOL_HEADER_SIZE) / block_size;
        assert!(blocks_per_pool > 0 && blocks_per_pool <= u16::MAX as usize);
        if i > 0 {
            assert!(SIZE_CLASSES[i - 1] < block_size);
        }
        table[i] = FixedClassInfo { block_size, blocks_per_pool };
        i += 1;
    }
    table
}

const fn build_size_class_cache() -> [u8; FIXED_SIZE_CACHE_COUNT] {
    let mut cache = [0u8; FIXED_SIZE_CACHE_COUNT];
    // cache[0] unused (size 0 is served as the first class by the caller)
    let mut quantum = 1;
    let mut class_index = 0;
    while quantum < FIXED_SIZE_CACHE_COUNT {
        let size = quantum << BITS_FOR_DEFAULT_ALIGNMENT;
        while SIZE_CLASSES[class_index] < size {
            class_index += 1;
        }
        cache[quantum] = class_index as u8;
        quantum += 1;
    }
    cache
}

/// Round `size` up to [`DEFAULT_ALIGNMENT`]. `None` on overflow.
#[inline]
#[must_use]
pub fn align_size(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(DEFAULT_ALIGNMENT)
}

/// True when an aligned request belongs to the fixed-size path.
#[inline]
#[must_use]
pub fn is_fixed_size(aligned_size: usize) -> bool {
    aligned_size <= MAX_FIXED_SIZE
}

/// Map an aligned request size to its size class index.
///
/// # Panics
/// Panics if `aligned_size` is zero or above [`MAX_FIXED_SIZE`]: routing such
/// a size here is a caller bug.
#[inline]
#[must_use]
pub fn fixed_size_to_table_index(aligned_size: usize) -> u8 {
    let quantum = aligned_size.div_ceil(DEFAULT_ALIGNMENT);
    assert!(
        quantum > 0 && quantum < FIXED_SIZE_CACHE_COUNT,
        "size {aligned_size} is outside the fixed-size range 1..={MAX_FIXED_SIZE}"
    );
    FIXED_SIZE_TO_INDEX[quantum]
}

/// Block size and pool capacity of a class.
///
/// # Panics
/// Panics if `class_index >= FIXED_CLASS_COUNT`.
#[inline]
#[must_use]
pub fn class_info(class_index: usize) -> FixedClassInfo {
    FIXED_CLASSES[class_index]
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(fixed_size_to_table_index(16), 0);
        assert_eq!(fixed_size_to_table_index(32), 1);
        assert_eq!(fixed_size_to_table_index(128), 7);
        assert_eq!(fixed_size_to_table_index(144), 8); // -> 160
        assert_eq!(fixed_size_to_table_index(160), 8);
        assert_eq!(fixed_size_to_table_index(MAX_FIXED_SIZE), (FIXED_CLASS_COUNT - 1) as u8);
    }

    #[test]
    fn test_lookup_is_smallest_fitting_class_and_monotonic() {
        let mut previous = 0u8;
        for size in 1..=MAX_FIXED_SIZE {
            let aligned = align_size(size).unwrap();
            let idx = fixed_size_to_table_index(aligned);
            let block = SIZE_CLASSES[idx as usize];
            assert!(block >= size, "class {block} too small for {size}");
            if idx > 0 {
                assert!(SIZE_CLASSES[idx as usize - 1] < aligned, "class {idx} not the smallest for {size}");
            }
            assert!(idx >= previous, "lookup not monotonic at {size}");
            previous = idx;
        }
    }

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(0), Some(0));
        assert_eq!(align_size(1), Some(16));
        assert_eq!(align_size(16), Some(16));
        assert_eq!(align_size(17), Some(32));
        assert_eq!(align_size(usize::MAX), None);
    }

    #[test]
    fn test_fixed_boundary() {
        assert!(is_fixed_size(align_size(MAX_FIXED_SIZE).unwrap()));
        assert!(!is_fixed_size(align_size(MAX_FIXED_SIZE + 1).unwrap()));
    }

    #[test]
    #[should_panic(expected = "outside the fixed-size range")]
    fn test_size_class_too_large() {
        let _ = fixed_size_to_table_index(MAX_FIXED_SIZE + DEFAULT_ALIGNMENT);
    }

    #[test]
    #[should_panic(expected = "outside the fixed-size range")]
    fn test_size_class_zero() {
        let _ = fixed_size_to_table_index(0);
    }

    #[test]
    #[should_panic(expected = "outside the fixed-size range")]
    fn test_size_class_near_usize_max() {
        let _ = fixed_size_to_table_index(usize::MAX - 3);
    }

    #[test]
    fn test_class_table_capacity() {
        for info in FIXED_CLASSES {
            assert!(POOL_HEADER_SIZE + info.blocks_per_pool * info.block_size <= PAGE_ALLOCATION_SIZE);
            assert!(POOL_HEADER_SIZE + (info.blocks_per_pool + 1) * info.block_size > PAGE_ALLOCATION_SIZE);
        }
        assert_eq!(class_info(0).blocks_per_pool, (PAGE_ALLOCATION_SIZE - POOL_HEADER_SIZE) / 16);
    }
}
