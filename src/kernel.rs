use std::ptr::NonNull;
use log::{debug, warn};
use crate::{
    block::{BLOCK_HEADER_SIZE, Block},
    config::Config,
    error::AllocError,
    list::{List, Node},
    region::{REGION_HEADER_SIZE, Region},
    utils::{self, checked_align},
};

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
///
/// The memory handed out by [`PlatformMemory::request_memory`] must be zero
/// filled, readable, writable and aligned to [`PlatformMemory::page_size`].
pub trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    ///
    /// # Safety
    /// `len` must be greater than zero.
    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// # Safety
    /// `addr` and `len` must describe a region previously returned by
    /// [`PlatformMemory::request_memory`] that is not used anymore.
    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// The operating system's virtual memory, reached through `mmap` on unix and
/// `VirtualAlloc` on windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemory;

#[cfg(unix)]
mod unix {
    use super::{OsMemory, PlatformMemory};

    use log::warn;

    use libc::{mmap, munmap, off_t, size_t};

    use std::{os::raw::{c_void, c_int}, ptr::NonNull};

    impl PlatformMemory for OsMemory {
        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            if unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } != 0 {
                warn!("munmap({:p}, {}) failed: {}", addr.as_ptr(), len, std::io::Error::last_os_error());
            }
        }

        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull, os::raw::c_void};

    use super::{OsMemory, PlatformMemory};

    use log::warn;

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for OsMemory {
        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, _len: usize) {
            unsafe {
                if let Err(error) = Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE) {
                    warn!("VirtualFree({:p}) failed: {}", addr.as_ptr(), error);
                }
            }
        }

        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// The internal data structure of the allocator. Here is where
/// we manage the low level memory requests: every byte the allocator
/// uses comes from a [`Region`] or a standalone mapping created here.
pub(crate) struct Kernel<M: PlatformMemory> {
    /// Source of raw memory.
    pub memory: M,
    /// Linked list of allocator memory [`Region`], in acquisition order.
    pub regions: List<Region>,
    /// Blocks that own a mapping for themselves. See [`Block::is_mapped`].
    pub mapped: List<Block>,
    /// Computer's page size, cached from [`PlatformMemory::page_size`].
    pub page_size: usize,
}

impl<M: PlatformMemory> Kernel<M> {
    /// Create a new instance of the allocator's `Kernel`. No memory is
    /// requested until the first allocation.
    pub(crate) fn new(memory: M) -> Self {
        let page_size = memory.page_size();

        Self {
            memory,
            regions: List::new(),
            mapped: List::new(),
            page_size,
        }
    }

    /// This function returns a new memory `region` big enough to hold a block
    /// of `size` bytes (already aligned).
    ///
    /// If we don't find any free block we can use, we know for sure there is no
    /// way we can allocate the requested size on our current Regions. Therefor,
    /// we need to map a new [`Region`], which holds a single used block of
    /// exactly `size` bytes followed by a free remainder when there is room for one.
    pub(crate) fn allocate_new_region(
        &mut self,
        size: usize,
        config: &Config,
    ) -> Result<NonNull<Node<Block>>, AllocError> {
        // What we really need to allocate is the requested size plus the
        // overhead introduced by our allocator's data structures
        let needed = size
            .checked_add(REGION_HEADER_SIZE + BLOCK_HEADER_SIZE)
            .ok_or(AllocError::OutOfMemory { size })?;

        let region_size = checked_align(needed.max(config.min_region_size), self.page_size)
            .ok_or(AllocError::OutOfMemory { size: needed })?;

        unsafe {
            let addr = self
                .memory
                .request_memory(region_size)
                .ok_or(AllocError::OutOfMemory { size: region_size })?;

            let mut region = self.regions.append(
                Region {
                    size: region_size,
                    blocks: List::new(),
                },
                addr,
            );

            debug!("mapped region {:p} of {} bytes", addr.as_ptr(), region_size);

            // First Node<Block> right after Node<Region>
            let block_addr = addr.add(REGION_HEADER_SIZE);

            // Useful block size
            let block_size = region_size - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;

            let block = region
                .as_mut()
                .data
                .blocks
                .append(Block::used(block_size, region), block_addr);

            region.as_mut().data.split(block, size);

            Ok(block)
        }
    }

    /// Unlinks `region` and gives its memory back to the OS.
    ///
    /// **SAFETY**: `region` must belong to this kernel and hold no live block.
    pub(crate) unsafe fn release_region(&mut self, region: NonNull<Node<Region>>) {
        unsafe {
            let size = region.as_ref().data.size;

            self.regions.remove(region);
            self.memory.return_memory(region.cast(), size);

            debug!("unmapped region {:p} of {} bytes", region.as_ptr(), size);
        }
    }

    /// Maps a block that owns its own region. Used for requests too big to be
    /// worth placing inside a [`Region`]. `size` must be aligned.
    ///
    /// The content is aligned to `align`, which must be a power of two no
    /// bigger than the page size. Mappings start on a page boundary, so the
    /// header is pushed `pad` bytes into the mapping when the header size is
    /// not already a multiple of `align`.
    pub(crate) fn map_standalone(&mut self, size: usize, align: usize) -> Result<NonNull<Node<Block>>, AllocError> {
        let pad = utils::align(BLOCK_HEADER_SIZE, align) - BLOCK_HEADER_SIZE;
        let len = size
            .checked_add(pad + BLOCK_HEADER_SIZE)
            .ok_or(AllocError::OutOfMemory { size })?;

        unsafe {
            let addr = self
                .memory
                .request_memory(len)
                .ok_or(AllocError::OutOfMemory { size: len })?;

            let block = self.mapped.append(Block::mapped(size, pad), addr.add(pad));

            debug!("mapped standalone block {:p} of {} bytes", addr.as_ptr(), len);

            Ok(block)
        }
    }

    /// Returns the mapping owned by `block` to the OS. The header is gone
    /// after this call.
    ///
    /// **SAFETY**: `block` must be a standalone block of this kernel.
    pub(crate) unsafe fn unmap_standalone(&mut self, block: NonNull<Node<Block>>) {
        unsafe {
            let len = block.as_ref().data.mapping_len();
            let addr = block.cast::<u8>().sub(block.as_ref().data.pad);

            self.mapped.remove(block);
            self.memory.return_memory(addr, len);

            debug!("unmapped standalone block {:p} of {} bytes", addr.as_ptr(), len);
        }
    }

    /// Returns every region and standalone mapping to the OS.
    pub(crate) fn release_all(&mut self) {
        if !self.mapped.is_empty() {
            warn!("releasing {} standalone blocks that were never freed", self.mapped.len());
        }

        while let Some(block) = self.mapped.first() {
            unsafe { self.unmap_standalone(block) };
        }

        while let Some(region) = self.regions.first() {
            unsafe { self.release_region(region) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::payload,
        testing::{CountingMemory, OsCall},
        utils::{ALIGNMENT, align},
    };

    #[test]
    fn os_memory_is_zeroed_and_writable() {
        let mut memory = OsMemory;
        let page = memory.page_size();
        assert!(page.is_power_of_two());

        unsafe {
            let addr = memory.request_memory(page).unwrap();
            assert_eq!(0, addr.as_ptr() as usize % page);

            let bytes = std::slice::from_raw_parts_mut(addr.as_ptr(), page);
            assert!(bytes.iter().all(|byte| *byte == 0));
            bytes.fill(0xAB);
            assert_eq!(0xAB, bytes[page - 1]);

            memory.return_memory(addr, page);
        }
    }

    #[test]
    fn new_region_is_rounded_to_minimum_size() {
        let mut kernel = Kernel::new(CountingMemory::default());
        let config = Config::default();

        let block = kernel.allocate_new_region(64, &config).unwrap();

        assert_eq!(1, kernel.regions.len());
        let region = unsafe { &kernel.regions.first().unwrap().as_ref().data };
        assert_eq!(align(config.min_region_size, kernel.page_size), region.size);
        assert_eq!(2, region.blocks.len());
        assert_eq!(64, unsafe { block.as_ref().data.size });
        assert_eq!(vec![OsCall::Request(region.size)], kernel.memory.calls());

        kernel.release_all();
        assert!(kernel.regions.is_empty());
        assert_eq!(OsCall::Return(align(config.min_region_size, kernel.page_size)), kernel.memory.calls()[1]);
    }

    #[test]
    fn standalone_mapping_round_trip() {
        let mut kernel = Kernel::new(CountingMemory::default());

        let block = kernel.map_standalone(200_000, ALIGNMENT).unwrap();
        unsafe {
            assert!(block.as_ref().data.is_mapped);
            assert!(block.as_ref().data.region.is_none());
            kernel.unmap_standalone(block);
        }

        assert!(kernel.mapped.is_empty());
        assert_eq!(
            vec![
                OsCall::Request(200_000 + BLOCK_HEADER_SIZE),
                OsCall::Return(200_000 + BLOCK_HEADER_SIZE),
            ],
            kernel.memory.calls(),
        );
    }

    #[test]
    #[cfg(unix)]
    fn failed_return_is_logged_not_fatal() {
        // Not page aligned, so the OS refuses it without touching anything.
        let addr = NonNull::new(1 as *mut u8).unwrap();

        unsafe { OsMemory.return_memory(addr, 4096) };
    }

    #[test]
    fn over_aligned_standalone_mapping_pads_the_header() {
        let mut kernel = Kernel::new(CountingMemory::default());
        let pad = align(BLOCK_HEADER_SIZE, 4096) - BLOCK_HEADER_SIZE;

        let block = kernel.map_standalone(200_000, 4096).unwrap();
        unsafe {
            assert_eq!(pad, block.as_ref().data.pad);
            assert_eq!(0, payload(block).as_ptr() as usize % 4096);
            kernel.unmap_standalone(block);
        }

        let len = pad + BLOCK_HEADER_SIZE + 200_000;
        assert_eq!(vec![OsCall::Request(len), OsCall::Return(len)], kernel.memory.calls());
    }

    #[test]
    fn failed_request_is_out_of_memory() {
        let mut kernel = Kernel::new(CountingMemory::failing());

        assert!(matches!(
            kernel.allocate_new_region(64, &Config::default()),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert!(matches!(kernel.map_standalone(1 << 20, ALIGNMENT), Err(AllocError::OutOfMemory { .. })));
        assert!(kernel.regions.is_empty());
        assert!(kernel.mapped.is_empty());
    }
}
