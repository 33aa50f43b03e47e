//! Intrusive free list threaded through the free pages themselves.
//!
//! This is the only place that reinterprets page memory: a free page's first word
//! holds a [`Run`] linking to the next free page, and pages are junk-filled on their
//! way in and out of the allocator. Everything above this module deals in physical
//! addresses.

use core::ptr::NonNull;

use crate::PAGE_SIZE;

/// Byte pattern written over a page when it is freed.
///
/// Reads through a dangling pointer into a freed page see this instead of stale data.
pub const FREE_JUNK: u8 = 0x01;

/// Byte pattern written over a page when it is allocated.
///
/// Callers must initialize what they use; reads of uninitialized page memory see this.
pub const ALLOC_JUNK: u8 = 0x05;

/// Node written directly into the first word of every free page.
#[repr(C)]
struct Run {
    next: Option<NonNull<Run>>,
}

const _: () = assert!(size_of::<Run>() <= PAGE_SIZE);

/// LIFO list of free pages.
///
/// The list owns the pages on it. It does no locking; each per-CPU list lives behind
/// its pool's lock.
pub(crate) struct FreeList {
    head: Option<NonNull<Run>>,
    len: usize,
}

// SAFETY: the list exclusively owns the pages it links; moving it to another CPU
// moves that ownership along with it.
unsafe impl Send for FreeList {}

impl FreeList {
    /// Creates an empty free list.
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of pages on the list.
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if this free list is empty.
    #[cfg(test)]
    pub(crate) const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a page onto the head of the list, overwriting its first word.
    ///
    /// # Safety
    ///
    /// `page` must point to `PAGE_SIZE` writable, page-aligned bytes that nothing else
    /// references and that are not already on any free list.
    pub(crate) unsafe fn push(&mut self, page: NonNull<u8>) {
        let run = page.cast::<Run>();
        // SAFETY: the caller hands us exclusive ownership of an aligned page.
        unsafe { run.write(Run { next: self.head }) };
        self.head = Some(run);
        self.len += 1;
    }

    /// Pops the most recently pushed page, handing ownership back to the caller.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let run = self.head?;
        // SAFETY: every node on the list was written by `push` and is owned by the list.
        self.head = unsafe { run.read().next };
        self.len -= 1;
        Some(run.cast())
    }
}

/// Overwrites a whole page with `pattern`.
///
/// # Safety
///
/// `page` must point to `PAGE_SIZE` writable bytes owned by the caller.
pub(crate) unsafe fn junk_fill(page: NonNull<u8>, pattern: u8) {
    // SAFETY: forwarded to the caller.
    unsafe { page.write_bytes(pattern, PAGE_SIZE) };
}
