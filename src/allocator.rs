use std::ptr::{self, NonNull};

use log::{debug, trace};

use crate::{
    block::{self, BLOCK_HEADER_SIZE, Block, MIN_SPLIT_REMAINDER},
    config::Config,
    error::AllocError,
    freelist::FreeList,
    kernel::{Kernel, OsMemory, PlatformMemory},
    list::Node,
    utils::{self, ALIGNMENT, checked_align},
};

/// General purpose allocator built directly on top of [`PlatformMemory`].
///
/// Small requests are served from regions, big mappings shared by many
/// blocks. Requests whose size reaches
/// [`Config::large_threshold`] get a mapping of their own that goes straight
/// back to the OS when freed.
///
/// ```text
///  allocate(size)
///       |
///       +-- large? --> standalone mapping
///       |
///       +-- first free block that fits? --> split it
///       |
///       +-- otherwise --> new region, split it
/// ```
///
/// The allocator does no locking. Wrap it in
/// [`LockedAllocator`](crate::LockedAllocator) or another lock to share it
/// between threads. Everything it mapped is unmapped when it is dropped.
pub struct Allocator<M: PlatformMemory = OsMemory> {
    kernel: Kernel<M>,
    config: Config,
}

/// Snapshot of the memory held by an [`Allocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Regions currently mapped.
    pub regions: usize,
    /// Bytes mapped for regions, headers included.
    pub region_bytes: usize,
    /// Standalone mappings currently alive.
    pub mapped: usize,
    /// Bytes mapped for standalone blocks, headers included.
    pub mapped_bytes: usize,
    /// Blocks inside regions, free or not.
    pub blocks: usize,
    /// Free blocks inside regions.
    pub free_blocks: usize,
    /// Content bytes of the free blocks.
    pub free_bytes: usize,
}

// The allocator exclusively owns every region and mapping it points into.
unsafe impl<M: PlatformMemory + Send> Send for Allocator<M> {}

impl Allocator<OsMemory> {
    /// Creates an allocator backed by the OS with the default [`Config`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_memory(OsMemory, config)
    }
}

impl Default for Allocator<OsMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PlatformMemory> Allocator<M> {
    /// Creates an allocator that takes its memory from `memory`.
    pub fn with_memory(memory: M, config: Config) -> Self {
        Self {
            kernel: Kernel::new(memory),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocates `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// Returns `Ok(None)` when `size` is zero. The content of the block is
    /// unspecified, see [`Allocator::allocate_zeroed`].
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.allocate_aligned(size, ALIGNMENT)
    }

    /// Allocates `size` bytes at an address that is a multiple of `align`.
    ///
    /// `align` must be a power of two no bigger than the page size, otherwise
    /// [`AllocError::UnsupportedAlignment`] is returned. Alignments up to
    /// [`ALIGNMENT`] behave exactly like [`Allocator::allocate`]. Bigger ones
    /// are served from a region block whose start is moved forward until the
    /// content is aligned, the bytes skipped becoming a free block.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.check_alignment(align)?;

        if size == 0 {
            return Ok(None);
        }

        let aligned = checked_align(size, ALIGNMENT).ok_or(AllocError::InvalidSize { count: 1, size })?;

        let block = self.allocate_block(aligned, align)?;

        Ok(Some(block::payload(block)))
    }

    /// Allocates room for `count` elements of `size` bytes and fills it with zeros.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::InvalidSize { count, size })?;

        let ptr = self.allocate(total)?;

        if let Some(ptr) = ptr {
            // Fresh mappings are already zeroed but recycled blocks are not.
            unsafe { ptr.as_ptr().write_bytes(0, total) };
        }

        Ok(ptr)
    }

    /// Releases the block at `ptr`. Does nothing for `None`.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed since.
    /// Debug builds check this and panic with
    /// [`AllocError::PreconditionViolation`] when it doesn't hold. See
    /// [`Allocator::try_free`] for a version that reports it instead.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };

        self.debug_check(ptr);

        unsafe { self.release(ptr) };
    }

    /// Releases the block at `ptr` after making sure it is a live allocation
    /// of this allocator, in every build.
    pub fn try_free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.check(ptr)?;

        unsafe { self.release(ptr) };

        Ok(())
    }

    /// Resizes the block at `ptr` to `new_size` bytes.
    ///
    /// - `None` behaves like [`Allocator::allocate`].
    /// - A `new_size` of zero frees the block and returns `Ok(None)`.
    /// - Shrinking keeps the block where it is and returns the same pointer.
    /// - Growing moves the content to a new block. If that fails the original
    ///   block is left untouched.
    ///
    /// # Safety
    /// Same as [`Allocator::free`].
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        unsafe { self.reallocate_aligned(ptr, new_size, ALIGNMENT) }
    }

    /// Same as [`Allocator::reallocate`] for a block that has to stay aligned
    /// to `align`. See [`Allocator::allocate_aligned`].
    ///
    /// # Safety
    /// Same as [`Allocator::free`].
    pub unsafe fn reallocate_aligned(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate_aligned(new_size, align);
        };

        self.debug_check(ptr);

        unsafe { self.resize(ptr, new_size, align) }
    }

    /// Same as [`Allocator::reallocate_aligned`] but `ptr` is checked in
    /// every build and [`AllocError::PreconditionViolation`] is returned when
    /// it is not a live allocation of this allocator.
    pub fn try_reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.check(ptr)?;

        unsafe { self.resize(ptr, new_size, align) }
    }

    /// Number of bytes usable at `ptr`, at least what was requested for it.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { block::header(ptr).as_ref().data.size }
    }

    /// Tells whether `ptr` is a live allocation of this allocator.
    ///
    /// Only the allocator's own headers are read, so any pointer can be checked.
    pub fn check(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let violation = AllocError::PreconditionViolation { addr: ptr.as_ptr() as usize };

        let node = self
            .blocks()
            .find(|node| block::payload(*node) == ptr)
            .ok_or(violation)?;

        if unsafe { node.as_ref().data.is_live() } {
            Ok(())
        } else {
            Err(violation)
        }
    }

    /// Walks every region and mapping to summarize the memory in use.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();

        for region in &self.kernel.regions {
            let region = unsafe { &region.as_ref().data };

            stats.regions += 1;
            stats.region_bytes += region.size;
            stats.blocks += region.blocks.len();
        }

        for node in FreeList::new(&self.kernel.regions).iter() {
            stats.free_blocks += 1;
            stats.free_bytes += unsafe { node.as_ref().data.size };
        }

        for node in &self.kernel.mapped {
            stats.mapped += 1;
            stats.mapped_bytes += unsafe { node.as_ref().data.mapping_len() };
        }

        stats
    }

    /// Gives the block at `ptr` back to its region or unmaps it.
    ///
    /// **SAFETY**: `ptr` must be a live allocation of this allocator.
    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let mut node = block::header(ptr);

            if node.as_ref().data.is_mapped {
                self.kernel.unmap_standalone(node);
                return;
            }

            node.as_mut().data.mark_free();

            let Some(mut region) = node.as_ref().data.region else {
                return;
            };

            region.as_mut().data.coalesce(node);

            if self.config.release_empty_regions && region.as_ref().data.is_unused() {
                self.kernel.release_region(region);
            }
        }
    }

    /// **SAFETY**: `ptr` must be a live allocation of this allocator.
    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize, align: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if new_size == 0 {
            unsafe { self.release(ptr) };
            return Ok(None);
        }

        self.check_alignment(align)?;

        let aligned = checked_align(new_size, ALIGNMENT)
            .ok_or(AllocError::InvalidSize { count: 1, size: new_size })?;

        unsafe {
            let node = block::header(ptr);
            let old_size = node.as_ref().data.size;

            if old_size >= aligned && ptr.as_ptr() as usize % align == 0 {
                if let Some(mut region) = node.as_ref().data.region {
                    region.as_mut().data.split(node, aligned);
                }

                return Ok(Some(ptr));
            }

            let Some(new_ptr) = self.allocate_aligned(new_size, align)? else {
                return Ok(None);
            };

            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));

            self.release(ptr);

            Ok(Some(new_ptr))
        }
    }

    fn check_alignment(&self, align: usize) -> Result<(), AllocError> {
        if align.is_power_of_two() && align <= self.kernel.page_size {
            Ok(())
        } else {
            Err(AllocError::UnsupportedAlignment { align })
        }
    }

    /// Finds or creates a block with at least `size` bytes of content that
    /// starts on a multiple of `align`.
    fn allocate_block(&mut self, size: usize, align: usize) -> Result<NonNull<Node<Block>>, AllocError> {
        if align <= ALIGNMENT {
            if self.config.is_large(size, BLOCK_HEADER_SIZE) {
                return self.kernel.map_standalone(size, ALIGNMENT);
            }

            return self.fit_block(size);
        }

        // Enough room to move the header forward to an aligned address and
        // still leave a valid free block in front of it.
        let padded = size
            .checked_add(align + MIN_SPLIT_REMAINDER)
            .ok_or(AllocError::InvalidSize { count: 1, size })?;

        if self.config.is_large(padded, BLOCK_HEADER_SIZE) {
            return self.kernel.map_standalone(size, align);
        }

        let node = self.fit_block(padded)?;

        unsafe {
            let Some(mut region) = node.as_ref().data.region else {
                return Ok(node);
            };

            let node = region.as_mut().data.shift(node, alignment_gap(node, align));
            region.as_mut().data.split(node, size);

            trace!("aligned block {:p} to {} bytes", node.as_ptr(), align);

            Ok(node)
        }
    }

    /// First free block that fits `size` bytes, or a new region.
    fn fit_block(&mut self, size: usize) -> Result<NonNull<Node<Block>>, AllocError> {
        let free_block = FreeList::new(&self.kernel.regions).find_free_block(size);

        if let Some(mut node) = free_block {
            trace!("reusing free block {:p} for {} bytes", node.as_ptr(), size);

            unsafe {
                node.as_mut().data.mark_used();

                if let Some(mut region) = node.as_ref().data.region {
                    region.as_mut().data.split(node, size);
                }
            }

            return Ok(node);
        }

        debug!("no free block fits {} bytes, mapping a new region", size);

        self.kernel.allocate_new_region(size, &self.config)
    }

    /// Every block header known to the allocator, regions first.
    fn blocks(&self) -> impl Iterator<Item = NonNull<Node<Block>>> + '_ {
        self.kernel
            .regions
            .nodes()
            .flat_map(|region| unsafe { region.as_ref().data.blocks.nodes() })
            .chain(self.kernel.mapped.nodes())
    }

    #[inline]
    fn debug_check(&self, ptr: NonNull<u8>) {
        if cfg!(debug_assertions) {
            if let Err(error) = self.check(ptr) {
                panic!("{error}");
            }
        }
    }
}

/// Bytes the header of `node` has to move forward for its content to start on
/// a multiple of `align`. The bytes skipped must be able to hold a free block
/// of their own, so a gap too small for one is widened by `align`.
fn alignment_gap(node: NonNull<Node<Block>>, align: usize) -> usize {
    let start = block::payload(node).as_ptr() as usize;
    let mut gap = utils::align(start, align) - start;

    while gap != 0 && gap < MIN_SPLIT_REMAINDER {
        gap += align;
    }

    gap
}

impl<M: PlatformMemory> Drop for Allocator<M> {
    fn drop(&mut self) {
        self.kernel.release_all();
    }
}
