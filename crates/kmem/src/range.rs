//! The physical range handed to the allocator at boot.

use core::iter::FusedIterator;

use crate::{ConfigError, PAGE_SIZE, PhysicalAddress};

/// The managed physical memory: everything from the end of the kernel image up to the
/// top of physical memory.
///
/// `kernel_end` need not be page-aligned; the first managed page is the first page
/// boundary at or above it. A trailing partial page below `physical_top` is not
/// managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    kernel_end: PhysicalAddress,
    physical_top: PhysicalAddress,
}

impl MemoryRange {
    /// Describes the range `[kernel_end, physical_top)`.
    pub const fn new(kernel_end: usize, physical_top: usize) -> Result<Self, ConfigError> {
        let Some(kernel_end) = PhysicalAddress::try_new(kernel_end) else {
            return Err(ConfigError::AddressTooWide(kernel_end));
        };
        let Some(physical_top) = PhysicalAddress::try_new(physical_top) else {
            return Err(ConfigError::AddressTooWide(physical_top));
        };
        if kernel_end.as_usize() > physical_top.as_usize() {
            return Err(ConfigError::InvertedRange {
                kernel_end,
                physical_top,
            });
        }

        Ok(Self {
            kernel_end,
            physical_top,
        })
    }

    /// Returns the first address after the kernel image.
    pub const fn kernel_end(&self) -> PhysicalAddress {
        self.kernel_end
    }

    /// Returns the first address past the end of physical memory.
    pub const fn physical_top(&self) -> PhysicalAddress {
        self.physical_top
    }

    /// Returns true if `addr` is a page the allocator may hold: page-aligned and inside
    /// `[kernel_end, physical_top)`.
    pub const fn contains_page(&self, addr: PhysicalAddress) -> bool {
        addr.is_aligned(PAGE_SIZE)
            && addr.as_usize() >= self.kernel_end.as_usize()
            && addr.as_usize() < self.physical_top.as_usize()
    }

    /// Returns the pages that initialization seeds the allocator with.
    pub const fn pages(&self) -> PageRange {
        PageRange {
            next: self.kernel_end.align_up(PAGE_SIZE).as_usize(),
            end: self.physical_top.as_usize(),
        }
    }

    /// Returns the number of whole pages in the range.
    pub const fn page_count(&self) -> usize {
        self.pages().remaining()
    }
}

/// Iterator over the page-aligned addresses of a [`MemoryRange`], lowest first.
#[derive(Debug, Clone)]
pub struct PageRange {
    next: usize,
    end: usize,
}

impl PageRange {
    const fn remaining(&self) -> usize {
        if self.next >= self.end {
            0
        } else {
            (self.end - self.next) / PAGE_SIZE
        }
    }
}

impl Iterator for PageRange {
    type Item = PhysicalAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }
        let page = PhysicalAddress::new(self.next);
        self.next += PAGE_SIZE;
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PageRange {}

impl FusedIterator for PageRange {}
