use std::{
    alloc::{GlobalAlloc, Layout},
    process,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard},
};

use crate::{
    allocator::{Allocator, Stats},
    config::Config,
    error::AllocError,
};

/// [`Allocator`] behind a mutex, usable as the `#[global_allocator]`.
///
/// The inner allocator is created on first use. Layouts may ask for any
/// alignment up to the page size, see [`Allocator::allocate_aligned`].
/// Bigger alignments get a null pointer.
///
/// ```rust,ignore
/// use mapalloc::LockedAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: LockedAllocator = LockedAllocator::new();
/// ```
///
/// Debug builds check every pointer given back through `dealloc` and
/// `realloc`. A pointer that is not a live allocation is reported on stderr
/// once the lock is released and the process is aborted, since a global
/// allocator must not unwind.
///
/// The allocator logs through the `log` crate while holding the lock, so a
/// logger installed next to a global `LockedAllocator` must not allocate.
pub struct LockedAllocator {
    inner: Mutex<Option<Allocator>>,
    config: Config,
}

impl LockedAllocator {
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            inner: Mutex::new(None),
            config,
        }
    }

    /// See [`Allocator::stats`]. Nothing is mapped before the first allocation.
    pub fn stats(&self) -> Stats {
        self.lock().as_ref().map(Allocator::stats).unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Allocator>> {
        // Operations only panic before they touch the block chains.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the inner allocator. The lock is released before this
    /// returns, so callers may allocate while handling the result.
    fn with<R>(&self, f: impl FnOnce(&mut Allocator) -> R) -> R {
        let mut guard = self.lock();
        let allocator = guard.get_or_insert_with(|| Allocator::with_config(self.config));

        f(allocator)
    }

    /// Frees `ptr`, checking it first in debug builds.
    ///
    /// **SAFETY**: in release builds `ptr` must be a live allocation.
    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.with(|allocator| {
            if cfg!(debug_assertions) {
                allocator.try_free(ptr)
            } else {
                unsafe { allocator.free(Some(ptr)) };
                Ok(())
            }
        })
    }

    /// Resizes `ptr`, checking it first in debug builds.
    ///
    /// **SAFETY**: in release builds `ptr` must be a live allocation.
    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize, align: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.with(|allocator| {
            if cfg!(debug_assertions) {
                allocator.try_reallocate(ptr, new_size, align)
            } else {
                unsafe { allocator.reallocate_aligned(Some(ptr), new_size, align) }
            }
        })
    }
}

impl Default for LockedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Reports a pointer that was never allocated or already freed. Must be
/// called without holding the lock: printing may allocate.
#[cold]
fn violation(error: AllocError) -> ! {
    eprintln!("mapalloc: {error}");
    process::abort()
}

unsafe impl GlobalAlloc for LockedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with(|allocator| {
            allocator
                .allocate_aligned(layout.size(), layout.align())
                .map_or(ptr::null_mut(), into_raw)
        })
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };

        if !ptr.is_null() {
            // Recycled blocks keep whatever they held before.
            unsafe { ptr.write_bytes(0, layout.size()) };
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        if let Err(error) = unsafe { self.release(ptr) } {
            violation(error);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.with(|allocator| {
                allocator
                    .allocate_aligned(new_size, layout.align())
                    .map_or(ptr::null_mut(), into_raw)
            });
        };

        match unsafe { self.resize(ptr, new_size, layout.align()) } {
            Ok(ptr) => into_raw(ptr),
            Err(error @ AllocError::PreconditionViolation { .. }) => violation(error),
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn global_alloc_round_trip() {
        let allocator = LockedAllocator::new();
        assert_eq!(Stats::default(), allocator.stats());

        unsafe {
            let layout = Layout::array::<u32>(16).unwrap();
            let ptr = allocator.alloc_zeroed(layout).cast::<u32>();
            assert!(!ptr.is_null());

            let values = std::slice::from_raw_parts_mut(ptr, 16);
            assert!(values.iter().all(|value| *value == 0));
            for (i, value) in values.iter_mut().enumerate() {
                *value = i as u32;
            }

            let grown = allocator.realloc(ptr.cast(), layout, 4096).cast::<u32>();
            assert!(!grown.is_null());
            assert_eq!(15, *grown.add(15));

            allocator.dealloc(grown.cast(), Layout::from_size_align(4096, 4).unwrap());
        }

        let stats = allocator.stats();
        assert_eq!(1, stats.regions);
        assert_eq!(stats.regions, stats.free_blocks);
    }

    #[test]
    fn over_aligned_layouts_are_honoured() {
        let allocator = LockedAllocator::new();

        for align in [32, 64, 128, 4096] {
            let layout = Layout::from_size_align(200, align).unwrap();

            unsafe {
                let ptr = allocator.alloc_zeroed(layout);
                assert!(!ptr.is_null());
                assert_eq!(0, ptr as usize % align);
                assert!(std::slice::from_raw_parts(ptr, 200).iter().all(|byte| *byte == 0));
                ptr.write_bytes(0xC3, 200);

                let grown = allocator.realloc(ptr, layout, 20_000);
                assert_eq!(0, grown as usize % align);
                assert!(std::slice::from_raw_parts(grown, 200).iter().all(|byte| *byte == 0xC3));

                allocator.dealloc(grown, Layout::from_size_align(20_000, align).unwrap());
            }
        }

        let stats = allocator.stats();
        assert_eq!(0, stats.mapped);
        assert_eq!(stats.regions, stats.free_blocks);

        let too_big = Layout::from_size_align(64, 1 << 30).unwrap();
        assert!(unsafe { allocator.alloc(too_big) }.is_null());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn rejected_release_leaves_the_lock_usable() {
        let allocator = LockedAllocator::new();
        let layout = Layout::from_size_align(32, 8).unwrap();

        unsafe {
            let _keep = allocator.alloc(layout);
            let ptr = NonNull::new(allocator.alloc(layout)).unwrap();

            assert_eq!(Ok(()), allocator.release(ptr));
            assert!(matches!(allocator.release(ptr), Err(AllocError::PreconditionViolation { .. })));
            assert!(matches!(allocator.resize(ptr, 64, 8), Err(AllocError::PreconditionViolation { .. })));

            // The guard was dropped with the error, so the mutex is free again.
            assert!(!allocator.alloc(layout).is_null());
        }

        assert!(!allocator.inner.is_poisoned());
    }

    #[test]
    fn threads_share_one_allocator() {
        let allocator = LockedAllocator::with_config(Config::new().with_min_region_size(4096));

        thread::scope(|scope| {
            for t in 0..4u8 {
                let allocator = &allocator;

                scope.spawn(move || {
                    let layout = Layout::from_size_align(48, 8).unwrap();
                    let mut ptrs = Vec::new();

                    for _ in 0..200 {
                        unsafe {
                            let ptr = allocator.alloc(layout);
                            assert!(!ptr.is_null());
                            ptr.write_bytes(t, layout.size());
                            ptrs.push(ptr);
                        }
                    }

                    for ptr in ptrs {
                        unsafe {
                            let bytes = std::slice::from_raw_parts(ptr, layout.size());
                            assert!(bytes.iter().all(|byte| *byte == t));
                            allocator.dealloc(ptr, layout);
                        }
                    }
                });
            }
        });

        let stats = allocator.stats();
        assert_eq!(0, stats.mapped);
        assert_eq!(stats.regions, stats.free_blocks);
    }
}
