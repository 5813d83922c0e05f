//! General purpose heap allocator that takes its memory straight from the OS.
//!
//! Every allocated block has an associated header with metadata that precedes
//! the actual memory block, therefore
//!
//! ```text
//! +--------------------------------+
//! | Header   | Actual memory block |
//! +--------------------------------+
//!            ^
//!            +-- returned pointer
//! ```
//!
//! Small and medium blocks live inside regions, mappings that are shared by
//! many blocks and grow the allocator when no free block fits a request.
//! Free blocks are found first-fit, split when they are bigger than needed
//! and merged with their free neighbours when released. Large blocks get a
//! mapping of their own that goes back to the OS as soon as they are freed.
//!
//! ```
//! use mapalloc::Allocator;
//!
//! let mut allocator = Allocator::new();
//!
//! let ptr = allocator.allocate(64).unwrap().unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 64);
//!     let ptr = allocator.reallocate(Some(ptr), 256).unwrap();
//!     allocator.free(ptr);
//! }
//! ```
//!
//! Payloads are aligned to [`ALIGNMENT`] bytes. Bigger alignments, up to the
//! page size, are available through [`Allocator::allocate_aligned`].
//!
//! [`Allocator`] is single threaded; [`LockedAllocator`] puts one behind a
//! mutex and implements [`std::alloc::GlobalAlloc`], so it can serve as the
//! `#[global_allocator]` of a program.

mod allocator;
mod block;
mod config;
mod error;
mod freelist;
mod kernel;
mod list;
mod locked;
mod region;
mod utils;

#[cfg(test)]
mod testing;

pub use allocator::{Allocator, Stats};
pub use config::{Config, DEFAULT_LARGE_THRESHOLD, DEFAULT_MIN_REGION_SIZE};
pub use error::AllocError;
pub use kernel::{OsMemory, PlatformMemory};
pub use locked::LockedAllocator;
pub use utils::ALIGNMENT;
