//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// Every payload handed out by the allocator is aligned to this many bytes.
/// Block and region headers are padded to a multiple of it as well.
pub const ALIGNMENT: usize = 16;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This method is used to align region sizes to be a multiple of
/// [`crate::PlatformMemory::page_size`] and block sizes to be a multiple of [`ALIGNMENT`].
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is too close to `usize::MAX`.
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|value| value & !(aligment - 1))
}
