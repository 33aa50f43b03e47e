//! The kernel-wide page allocator.
//!
//! Boot code calls [`init`] exactly once, on one CPU, before any other CPU allocates.
//! After that the allocator lives for the rest of the system's lifetime and is
//! reached through [`get`] or the [`allocate`] / [`free`] shorthands.

use spin::Once;

use crate::arch::CurrentCpu;
use crate::{AddressTranslator, ConfigError, MemoryRange, PageAllocator, PhysicalAddress};

/// The allocator type installed by [`init`].
pub type GlobalPageAllocator = PageAllocator<CurrentCpu>;

static PAGE_ALLOCATOR: Once<GlobalPageAllocator> = Once::new();

/// Creates the global allocator and seeds it with every page in `range`.
///
/// All initial pages go to the calling CPU's pool.
///
/// # Panics
///
/// Panics if the allocator has already been initialized.
pub fn init(
    range: MemoryRange,
    cpu_count: usize,
    translator: AddressTranslator,
) -> Result<&'static GlobalPageAllocator, ConfigError> {
    let mut created = false;
    let allocator = PAGE_ALLOCATOR.try_call_once(|| {
        created = true;
        PageAllocator::initialize(range, cpu_count, translator, CurrentCpu::new())
    })?;

    assert!(created, "page allocator already initialized");
    Ok(allocator)
}

/// Returns true once [`init`] has completed.
pub fn is_initialized() -> bool {
    PAGE_ALLOCATOR.is_completed()
}

/// Returns the global allocator if it has been initialized.
pub fn try_get() -> Option<&'static GlobalPageAllocator> {
    PAGE_ALLOCATOR.get()
}

/// Returns the global allocator.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn get() -> &'static GlobalPageAllocator {
    PAGE_ALLOCATOR
        .get()
        .expect("page allocator not initialized; call kmem::global::init during boot")
}

/// Allocates a page from the global allocator. See [`PageAllocator::allocate`].
pub fn allocate() -> Option<PhysicalAddress> {
    get().allocate()
}

/// Returns a page to the global allocator. See [`PageAllocator::free`].
pub fn free(addr: PhysicalAddress) {
    get().free(addr);
}
