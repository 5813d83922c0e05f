//! Helpers shared by the unit tests of every module.

use std::{alloc::Layout, cell::{Cell, RefCell}, ptr::NonNull, rc::Rc};

use crate::{OsMemory, PlatformMemory};

/// A call made to the OS through [`CountingMemory`], with its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OsCall {
    Request(usize),
    Return(usize),
}

/// [`PlatformMemory`] that forwards to [`OsMemory`] and records every call.
/// Clones share the same log, so a test can keep one to look at the calls
/// made by an allocator that owns the other.
#[derive(Debug, Default, Clone)]
pub(crate) struct CountingMemory {
    calls: Rc<RefCell<Vec<OsCall>>>,
    fail_requests: Rc<Cell<bool>>,
}

impl CountingMemory {
    /// Memory source whose requests always fail.
    pub fn failing() -> Self {
        let memory = Self::default();
        memory.set_failing(true);
        memory
    }

    pub fn set_failing(&self, fail_requests: bool) {
        self.fail_requests.set(fail_requests);
    }

    pub fn calls(&self) -> Vec<OsCall> {
        self.calls.borrow().clone()
    }

    pub fn requests(&self) -> usize {
        self.calls.borrow().iter().filter(|call| matches!(call, OsCall::Request(_))).count()
    }

    pub fn returns(&self) -> usize {
        self.calls.borrow().iter().filter(|call| matches!(call, OsCall::Return(_))).count()
    }
}

impl PlatformMemory for CountingMemory {
    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.calls.borrow_mut().push(OsCall::Request(len));

        if self.fail_requests.get() {
            return None;
        }

        unsafe { OsMemory.request_memory(len) }
    }

    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
        self.calls.borrow_mut().push(OsCall::Return(len));

        unsafe { OsMemory.return_memory(addr, len) }
    }

    fn page_size(&self) -> usize {
        OsMemory.page_size()
    }
}

/// Page aligned, zeroed scratch memory to lay headers on without going
/// through the allocator.
pub(crate) struct Arena {
    start: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    pub fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 4096).unwrap();
        let start = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();

        Self { start, layout }
    }

    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.start.as_ptr(), self.layout) }
    }
}
