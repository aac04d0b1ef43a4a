use thiserror::Error;

/// Recoverable failures of the memory core.
///
/// Programming errors (double free, corrupted freed-block tag, metadata type
/// mismatch, allocation before initialization) are not represented here: they
/// panic at the point of detection.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("platform allocation failed: {0}")]
    PlatformAlloc(#[source] std::io::Error),
    #[error("platform release failed: {0}")]
    PlatformRelease(#[source] std::io::Error),
    #[error("allocation size {size} overflows the address space")]
    SizeOverflow { size: usize },
    #[error("alignment {alignment} is not a power of two or exceeds the page allocation size")]
    UnsupportedAlignment { alignment: usize },
}
