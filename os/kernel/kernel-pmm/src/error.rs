use kernel_memory_addresses::PhysicalAddress;

/// Errors reported by the page-frame allocator.
///
/// [`OutOfMemory`](Self::OutOfMemory) and [`OutOfRange`](Self::OutOfRange)
/// are ordinary outcomes: the first tells the caller to try elsewhere, the
/// second that the address belongs to a different pool. Everything else is a
/// caller bug or a broken bootstrap sequence.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address {0} is not managed by this pool")]
    OutOfRange(PhysicalAddress),
    #[error("address {addr} is not aligned to the page size {page_size:#x}")]
    Misaligned {
        addr: PhysicalAddress,
        page_size: u64,
    },
    #[error("page {0} is already free")]
    DoubleFree(PhysicalAddress),
    #[error("size class {0} does not exist")]
    InvalidSizeClass(usize),
    #[error("size classes must be strictly increasing and at most 6 bits apart")]
    InvalidSizeClassTable,
    #[error("address range overlaps an already registered range")]
    OverlappingRange,
    #[error("too many address ranges")]
    TooManyRanges,
    #[error("workarea too small: {needed} bytes needed, {available} available")]
    WorkareaTooSmall { needed: usize, available: usize },
    #[error("operation not valid in the current bootstrap phase")]
    WrongPhase,
}
