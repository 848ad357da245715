use kernel_pmm::PageAllocError;

/// Errors of the object allocator.
///
/// `OutOfMemory` and `OutOfRange` are outcomes callers are expected to
/// handle. `InternalInconsistency` means allocator state and caller behavior
/// disagree (an object nobody owns, a teardown with live objects); it is
/// logged where it is detected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("address {0:#x} is not owned by this allocator")]
    OutOfRange(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(&'static str),
}

impl From<PageAllocError> for AllocError {
    #[allow(clippy::cast_possible_truncation)]
    fn from(e: PageAllocError) -> Self {
        match e {
            PageAllocError::OutOfMemory => Self::OutOfMemory,
            PageAllocError::OutOfRange(addr) => Self::OutOfRange(addr.as_u64() as usize),
            PageAllocError::Misaligned { .. } => Self::InvalidArgument("misaligned page address"),
            PageAllocError::InvalidSizeClass(_) | PageAllocError::InvalidSizeClassTable => {
                Self::InvalidArgument("unknown size class")
            }
            PageAllocError::DoubleFree(_) => Self::InternalInconsistency("page freed twice"),
            PageAllocError::OverlappingRange
            | PageAllocError::TooManyRanges
            | PageAllocError::WorkareaTooSmall { .. }
            | PageAllocError::WrongPhase => Self::InternalInconsistency("page pool not ready"),
        }
    }
}
