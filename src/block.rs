use std::{mem, ptr::NonNull};
use crate::{list::{Link, Node}, region::Region, utils::{ALIGNMENT, align}};


/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since we always use our `Block` as a node of our linked list.
/// It is padded to [`ALIGNMENT`] so the content that follows it stays aligned.
pub(crate) const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Node<Block>>(), ALIGNMENT);

/// Smallest payload a split remainder may have. Anything smaller stays attached
/// to the block being split as internal fragmentation.
pub(crate) const MIN_SPLIT_REMAINDER: usize = BLOCK_HEADER_SIZE + ALIGNMENT;

/// Tag stored in the header of a block that is handed out to the user.
pub(crate) const LIVE_TAG: u32 = 0xA110_C8ED;

/// Tag stored in the header of a block that sits free inside a region.
pub(crate) const FREED_TAG: u32 = 0xF4EE_B10C;

/// This is the structure of a block. The fields of the block are it's metadata,
/// content is placed after this header.
///
/// The following diagram represents this structure ignoring that the block will be
/// wrapped inside a [`Node`]
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |       region        |        |
/// +---------------------+        | -> Header
/// |         tag         |        |
/// +---------------------+        |
/// |         pad         |        |
/// +---------------------+        |
/// | is_free | is_mapped |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        |
/// |         ...         |        | -> Addressable content
/// |         ...         |        |
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// Blocks that live inside a [`Region`] are chained in address order through the
/// region's block list. Blocks with `is_mapped` set own a whole mapping for
/// themselves and are chained in the allocator's list of standalone mappings instead.
pub(crate) struct Block {
    /// Size of the content of the block. Always a multiple of [`ALIGNMENT`].
    pub size: usize,
    /// Region which the block belongs to. `None` for standalone mappings.
    pub region: Link<Node<Region>>,
    /// Bytes between the start of a standalone mapping and this header. Non
    /// zero only when the content had to be aligned past [`ALIGNMENT`].
    pub pad: usize,
    /// Either [`LIVE_TAG`] or [`FREED_TAG`].
    pub tag: u32,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
    /// Flag to tell whether the block occupies its own OS mapping.
    pub is_mapped: bool,
}

impl Block {
    /// Header of a used block that belongs to `region`.
    pub fn used(size: usize, region: NonNull<Node<Region>>) -> Self {
        Self { size, region: Some(region), pad: 0, tag: LIVE_TAG, is_free: false, is_mapped: false }
    }

    /// Header of a free block that belongs to `region`.
    pub fn free(size: usize, region: NonNull<Node<Region>>) -> Self {
        Self { size, region: Some(region), pad: 0, tag: FREED_TAG, is_free: true, is_mapped: false }
    }

    /// Header of a block that owns a standalone mapping and sits `pad` bytes
    /// into it.
    pub fn mapped(size: usize, pad: usize) -> Self {
        Self { size, region: None, pad, tag: LIVE_TAG, is_free: false, is_mapped: true }
    }

    /// Length of the standalone mapping that holds this block.
    #[inline]
    pub fn mapping_len(&self) -> usize {
        self.pad + BLOCK_HEADER_SIZE + self.size
    }

    pub fn mark_used(&mut self) {
        self.is_free = false;
        self.tag = LIVE_TAG;
    }

    pub fn mark_free(&mut self) {
        self.is_free = true;
        self.tag = FREED_TAG;
    }

    /// Whether the header looks like one we handed out and has not been released yet.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.tag == LIVE_TAG && !self.is_free
    }
}

/// Returns the address of the content of `node`.
#[inline]
pub(crate) fn payload(node: NonNull<Node<Block>>) -> NonNull<u8> {
    unsafe { node.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

/// Recovers the header that precedes the content at `ptr`.
///
/// **SAFETY**: `ptr` must have been returned by [`payload`].
#[inline]
pub(crate) unsafe fn header(ptr: NonNull<u8>) -> NonNull<Node<Block>> {
    unsafe { ptr.sub(BLOCK_HEADER_SIZE).cast() }
}

/// Address of the first byte after the content of `node`.
#[inline]
pub(crate) fn end(node: NonNull<Node<Block>>) -> usize {
    unsafe { payload(node).as_ptr() as usize + node.as_ref().data.size }
}
