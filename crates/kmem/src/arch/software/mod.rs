//! Software emulation for testing and development.
//!
//! This module lets the allocator run on a host without real physical memory or
//! real CPUs:
//! - [`EmulatedMemory`] is a page-aligned heap buffer whose offsets act as physical
//!   addresses.
//! - [`EmulatedCpu`] gives every host thread a fixed CPU identity, set with
//!   [`set_current_cpu`]. A thread "migrates" only when it calls `set_current_cpu`,
//!   which is refused while a pinned section is running.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

use super::PAGE_SIZE;
use crate::{CpuId, CpuLocal};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// The CPU pinning implementation used by the global allocator under emulation.
pub type CurrentCpu = EmulatedCpu;

/// Validates a physical address for software emulation.
///
/// Physical addresses must fit within 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    static PIN_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Sets the CPU the calling thread runs on from now on.
///
/// # Panics
///
/// Panics if the thread is inside a pinned section.
pub fn set_current_cpu(cpu: CpuId) {
    assert!(
        PIN_DEPTH.with(Cell::get) == 0,
        "cannot migrate a pinned thread"
    );
    CURRENT_CPU.with(|c| c.set(cpu.as_usize()));
}

/// Returns the CPU the calling thread runs on. Threads start on CPU 0.
pub fn current_cpu() -> CpuId {
    CpuId::new(CURRENT_CPU.with(Cell::get))
}

/// Returns true while the calling thread is inside a pinned section.
pub fn is_pinned() -> bool {
    PIN_DEPTH.with(Cell::get) > 0
}

/// Per-thread CPU identity used in place of real hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmulatedCpu;

impl EmulatedCpu {
    /// Creates the emulated pinning handle.
    pub const fn new() -> Self {
        Self
    }
}

/// Leaves a pinned section, also when the section unwinds.
struct PinGuard;

impl PinGuard {
    fn enter() -> Self {
        PIN_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        PIN_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

impl CpuLocal for EmulatedCpu {
    fn pinned<R>(&self, f: impl FnOnce(CpuId) -> R) -> R {
        let _guard = PinGuard::enter();
        f(current_cpu())
    }
}

/// Emulated physical memory.
///
/// Physical address `n` is byte `n` of the buffer. The buffer is page-aligned so that
/// page-aligned physical addresses translate to page-aligned host pointers.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is only written through pages the allocator hands out one
// owner at a time; the handle itself is just a base pointer and a size.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) else {
            panic!("emulated memory size {size:#x} is too large");
        };

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout)
        };

        Self { base, layout }
    }

    /// Translates a physical address to a virtual address (pointer into the buffer).
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: phys is within the buffer.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a virtual address (pointer) back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl core::fmt::Debug for EmulatedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmulatedMemory")
            .field("base", &self.base)
            .field("size", &self.size())
            .finish()
    }
}
