use thiserror::Error;

/// Failures reported by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map more memory.
    #[error("out of memory: the OS could not map {size} bytes")]
    OutOfMemory { size: usize },
    /// The byte count of a request does not fit in a `usize`, either when
    /// multiplying `count * size` or when rounding it up to the alignment.
    /// Single object requests report a `count` of one.
    #[error("invalid size: {count} * {size} bytes exceeds usize::MAX once aligned")]
    InvalidSize { count: usize, size: usize },
    /// The alignment is not a power of two or is bigger than a page.
    #[error("unsupported alignment: {align} bytes")]
    UnsupportedAlignment { align: usize },
    /// A pointer given back to the allocator has no live block behind it,
    /// e.g. a double free or a pointer we never handed out.
    #[error("precondition violation: {addr:#x} is not a live allocation")]
    PreconditionViolation { addr: usize },
}
