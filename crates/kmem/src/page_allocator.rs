//! Per-CPU physical page allocator.
//!
//! Each CPU owns a pool of free pages behind its own lock. Pages are freed into the
//! pool of the CPU doing the freeing and allocated from the caller's own pool; only
//! when that pool is empty does the caller scan the other pools and steal the first
//! free page it finds. The scan holds at most one pool lock at a time and never
//! touches the caller's own pool, so concurrent thieves cannot deadlock on each other
//! or on themselves.

use core::fmt;
use core::ptr::NonNull;

use crate::free_list::{self, ALLOC_JUNK, FREE_JUNK};
use crate::pool::CpuPool;
use crate::{
    AddressTranslator, ConfigError, CpuId, CpuLocal, MAX_CPUS, MemoryRange, PAGE_SIZE,
    PhysicalAddress, PoolSnapshot,
};

/// Physical page allocator with one free list per CPU.
///
/// Allocation and release are safe to call concurrently from every CPU. The type is
/// generic over how the current CPU is determined so that tests can pin host threads
/// to emulated CPUs.
pub struct PageAllocator<C> {
    pools: [CpuPool; MAX_CPUS],
    cpu_count: usize,
    range: MemoryRange,
    translator: AddressTranslator,
    cpu: C,
}

impl<C: CpuLocal> PageAllocator<C> {
    /// Creates `cpu_count` empty pools and seeds them with every page in `range`.
    ///
    /// Seeding releases each page through [`free`](Self::free), so every initial page
    /// lands in the pool of the CPU running this function. Other CPUs get their first
    /// pages by stealing.
    ///
    /// Must run on one CPU, before any other allocator call. `translator` must be able
    /// to reach every page in `range`.
    pub fn initialize(
        range: MemoryRange,
        cpu_count: usize,
        translator: AddressTranslator,
        cpu: C,
    ) -> Result<Self, ConfigError> {
        if cpu_count == 0 {
            return Err(ConfigError::NoCpus);
        }
        if cpu_count > MAX_CPUS {
            return Err(ConfigError::TooManyCpus {
                requested: cpu_count,
                max: MAX_CPUS,
            });
        }

        let allocator = Self {
            pools: [const { CpuPool::new() }; MAX_CPUS],
            cpu_count,
            range,
            translator,
            cpu,
        };

        for page in range.pages() {
            allocator.free(page);
        }

        log::info!(
            "page allocator: {} pages in [{}, {}) across {} CPUs, seeded on {}",
            range.page_count(),
            range.kernel_end(),
            range.physical_top(),
            cpu_count,
            allocator.cpu.pinned(|cpu| cpu),
        );

        Ok(allocator)
    }

    /// Allocates one page, filled with [`ALLOC_JUNK`].
    ///
    /// Takes the page from the calling CPU's pool, or steals one from another CPU if
    /// that pool is empty. Returns `None` if every pool is empty; that is an ordinary
    /// out-of-memory condition for the caller to handle.
    pub fn allocate(&self) -> Option<PhysicalAddress> {
        let (cpu, local) = self.cpu.pinned(|cpu| {
            let pool = self.pool(cpu);
            let page = pool.lock().pop();
            if page.is_some() {
                pool.stats().record_local_allocation();
            }
            (cpu, page)
        });

        let Some(page) = local.or_else(|| self.steal_page(cpu)) else {
            log::debug!("page allocator: out of pages ({cpu} found every pool empty)");
            return None;
        };

        // SAFETY: the page just left a free list, so the caller now owns it exclusively.
        unsafe { free_list::junk_fill(page, ALLOC_JUNK) };
        Some(self.page_address(page))
    }

    /// Returns a page to the calling CPU's pool, filling it with [`FREE_JUNK`].
    ///
    /// `addr` must have come from [`allocate`](Self::allocate) and must not be used by
    /// the caller afterwards.
    ///
    /// # Panics
    ///
    /// Panics without touching any pool if `addr` is not page-aligned or lies outside
    /// `[kernel_end, physical_top)`. Such an address means memory is already corrupt
    /// somewhere else.
    pub fn free(&self, addr: PhysicalAddress) {
        self.check_release(addr);
        let page = self.page_pointer(addr);

        // SAFETY: `addr` is a managed page and the caller gives up all access to it.
        unsafe { free_list::junk_fill(page, FREE_JUNK) };

        self.cpu.pinned(|cpu| {
            let pool = self.pool(cpu);
            // SAFETY: as above; ownership of the page moves to the list.
            unsafe { pool.lock().push(page) };
            pool.stats().record_free();
        });
    }

    /// Takes the first free page found in any pool other than `excluded`'s.
    ///
    /// Pools are scanned in index order. The page is returned as is, without junk
    /// filling; [`allocate`](Self::allocate) is the usual way in.
    pub fn steal(&self, excluded: CpuId) -> Option<PhysicalAddress> {
        self.steal_page(excluded).map(|page| self.page_address(page))
    }

    /// Returns the number of free pages across all pools.
    ///
    /// Pools are read one at a time, so the total is only exact while no other CPU is
    /// allocating or freeing.
    pub fn free_pages(&self) -> usize {
        self.pools()
            .iter()
            .map(|pool| self.cpu.pinned(|_| pool.len()))
            .sum()
    }

    /// Returns the number of free pages in `cpu`'s pool.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` has no pool.
    pub fn free_pages_on(&self, cpu: CpuId) -> usize {
        let pool = self.pool(cpu);
        self.cpu.pinned(|_| pool.len())
    }

    /// Returns the usage counters of `cpu`'s pool.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` has no pool.
    pub fn stats(&self, cpu: CpuId) -> PoolSnapshot {
        self.pool(cpu).stats().snapshot()
    }

    /// Returns the number of CPUs with a pool.
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// Returns the managed physical range.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// Returns the number of pages the allocator manages in total.
    pub fn total_pages(&self) -> usize {
        self.range.page_count()
    }

    /// Returns the translator used to reach page memory.
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    fn pools(&self) -> &[CpuPool] {
        &self.pools[..self.cpu_count]
    }

    fn pool(&self, cpu: CpuId) -> &CpuPool {
        match self.pools().get(cpu.as_usize()) {
            Some(pool) => pool,
            None => panic!("{cpu} has no page pool ({} CPUs configured)", self.cpu_count),
        }
    }

    fn steal_page(&self, thief: CpuId) -> Option<NonNull<u8>> {
        for (index, pool) in self.pools().iter().enumerate() {
            let victim = CpuId::new(index);
            if victim == thief {
                continue;
            }

            // Pinned like every other lock span; the guard is dropped before the
            // next victim is tried, so at most one pool lock is held.
            let page = self.cpu.pinned(|_| pool.lock().pop());
            if let Some(page) = page {
                pool.stats().record_stolen_from();
                if let Some(own) = self.pools().get(thief.as_usize()) {
                    own.stats().record_steal();
                }
                log::trace!(
                    "page allocator: {thief} stole {} from {victim}",
                    self.page_address(page)
                );
                return Some(page);
            }
        }

        None
    }

    fn check_release(&self, addr: PhysicalAddress) {
        if !addr.is_aligned(PAGE_SIZE) {
            invalid_release(format_args!("free: {addr} is not page-aligned"));
        }
        if addr < self.range.kernel_end() {
            invalid_release(format_args!(
                "free: {addr} is below kernel end {}",
                self.range.kernel_end()
            ));
        }
        if addr >= self.range.physical_top() {
            invalid_release(format_args!(
                "free: {addr} is at or above physical top {}",
                self.range.physical_top()
            ));
        }
    }

    fn page_pointer(&self, addr: PhysicalAddress) -> NonNull<u8> {
        match NonNull::new(self.translator.phys_to_ptr::<u8>(addr)) {
            Some(page) => page,
            None => panic!("page {addr} translates to a null pointer"),
        }
    }

    fn page_address(&self, page: NonNull<u8>) -> PhysicalAddress {
        self.translator.ptr_to_phys(page.as_ptr())
    }
}

#[cold]
#[track_caller]
fn invalid_release(message: fmt::Arguments<'_>) -> ! {
    log::error!("{message}");
    panic!("{message}");
}

impl<C> fmt::Debug for PageAllocator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("cpu_count", &self.cpu_count)
            .field("range", &self.range)
            .field("translator", &self.translator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::{EmulatedCpu, set_current_cpu};

    /// Pages below the managed range, standing in for the kernel image.
    const KERNEL_PAGES: usize = 2;

    fn on_cpu(index: usize) {
        set_current_cpu(CpuId::new(index));
    }

    fn setup(cpu_count: usize, pages: usize) -> PageAllocator<EmulatedCpu> {
        let kernel_end = KERNEL_PAGES * PAGE_SIZE;
        let physical_top = kernel_end + pages * PAGE_SIZE;
        let range = MemoryRange::new(kernel_end, physical_top).unwrap();

        PageAllocator::initialize(
            range,
            cpu_count,
            AddressTranslator::emulated(physical_top),
            EmulatedCpu::new(),
        )
        .unwrap()
    }

    fn page_bytes(allocator: &PageAllocator<EmulatedCpu>, addr: PhysicalAddress) -> &[u8] {
        let ptr = allocator.translator().phys_to_ptr::<u8>(addr);
        // SAFETY: the page lies inside the emulated memory, which lives as long as the
        // allocator, and the test does not write to it while the slice is alive.
        unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) }
    }

    fn free_counts(allocator: &PageAllocator<EmulatedCpu>) -> Vec<usize> {
        (0..allocator.cpu_count())
            .map(|cpu| allocator.free_pages_on(CpuId::new(cpu)))
            .collect()
    }

    mod initialization {
        use super::*;

        #[test]
        fn seeds_every_page_in_range() {
            let allocator = setup(4, 16);
            assert_eq!(allocator.free_pages(), 16);
            assert_eq!(allocator.total_pages(), 16);
        }

        #[test]
        fn seeds_only_the_initializing_cpu() {
            on_cpu(2);
            let allocator = setup(4, 16);
            assert_eq!(free_counts(&allocator), [0, 0, 16, 0]);
            assert_eq!(allocator.stats(CpuId::new(2)).frees, 16);
        }

        #[test]
        fn unaligned_kernel_end_is_rounded_up() {
            let range = MemoryRange::new(PAGE_SIZE + 8, 4 * PAGE_SIZE).unwrap();
            let allocator = PageAllocator::initialize(
                range,
                1,
                AddressTranslator::emulated(4 * PAGE_SIZE),
                EmulatedCpu::new(),
            )
            .unwrap();

            assert_eq!(allocator.free_pages(), 2);
            let mut pages = vec![
                allocator.allocate().unwrap(),
                allocator.allocate().unwrap(),
            ];
            pages.sort();
            assert_eq!(
                pages,
                [
                    PhysicalAddress::new(2 * PAGE_SIZE),
                    PhysicalAddress::new(3 * PAGE_SIZE)
                ]
            );
        }

        #[test]
        fn rejects_zero_cpus() {
            let range = MemoryRange::new(0, PAGE_SIZE).unwrap();
            let result = PageAllocator::initialize(
                range,
                0,
                AddressTranslator::emulated(PAGE_SIZE),
                EmulatedCpu::new(),
            );
            assert_eq!(result.unwrap_err(), ConfigError::NoCpus);
        }

        #[test]
        fn rejects_too_many_cpus() {
            let range = MemoryRange::new(0, PAGE_SIZE).unwrap();
            let result = PageAllocator::initialize(
                range,
                MAX_CPUS + 1,
                AddressTranslator::emulated(PAGE_SIZE),
                EmulatedCpu::new(),
            );
            assert_eq!(
                result.unwrap_err(),
                ConfigError::TooManyCpus {
                    requested: MAX_CPUS + 1,
                    max: MAX_CPUS,
                }
            );
        }
    }

    mod allocation {
        use super::*;

        #[test]
        fn returns_managed_page_filled_with_alloc_junk() {
            let allocator = setup(2, 8);
            let addr = allocator.allocate().unwrap();

            assert!(allocator.range().contains_page(addr));
            assert!(page_bytes(&allocator, addr).iter().all(|&b| b == ALLOC_JUNK));
            assert_eq!(allocator.free_pages(), 7);
            assert_eq!(allocator.stats(CpuId::new(0)).local_allocations, 1);
        }

        #[test]
        fn reuses_most_recently_freed_page() {
            let allocator = setup(1, 8);
            let first = allocator.allocate().unwrap();
            let second = allocator.allocate().unwrap();

            allocator.free(first);
            allocator.free(second);

            assert_eq!(allocator.allocate(), Some(second));
            assert_eq!(allocator.allocate(), Some(first));
        }

        #[test]
        fn free_after_allocate_restores_list_and_fills_free_junk() {
            let allocator = setup(2, 8);
            let before = allocator.free_pages_on(CpuId::new(0));

            let addr = allocator.allocate().unwrap();
            allocator.free(addr);

            assert_eq!(allocator.free_pages_on(CpuId::new(0)), before);
            let body = &page_bytes(&allocator, addr)[size_of::<usize>()..];
            assert!(body.iter().all(|&b| b == FREE_JUNK));
        }

        #[test]
        fn freed_page_joins_the_releasing_cpu() {
            let allocator = setup(2, 8);
            let addr = allocator.allocate().unwrap();

            on_cpu(1);
            allocator.free(addr);

            assert_eq!(free_counts(&allocator), [7, 1]);
        }

        #[test]
        fn exhaustion_returns_none_without_touching_lists() {
            let allocator = setup(3, 6);
            let pages: Vec<_> = core::iter::from_fn(|| allocator.allocate()).collect();
            assert_eq!(pages.len(), 6);

            assert_eq!(allocator.allocate(), None);
            assert_eq!(allocator.allocate(), None);
            assert_eq!(free_counts(&allocator), [0, 0, 0]);

            for &page in &pages {
                allocator.free(page);
            }
            assert_eq!(allocator.free_pages(), 6);
        }

        #[test]
        fn empty_range_is_immediately_exhausted() {
            let allocator = setup(2, 0);
            assert_eq!(allocator.free_pages(), 0);
            assert_eq!(allocator.allocate(), None);
        }

        #[test]
        fn releases_every_lock() {
            let allocator = setup(2, 1);
            on_cpu(1);
            let addr = allocator.allocate().unwrap();
            allocator.free(addr);

            assert!(allocator.pools().iter().all(|pool| !pool.is_locked()));
        }

        #[test]
        #[should_panic(expected = "cpu5 has no page pool (2 CPUs configured)")]
        fn unknown_cpu_panics() {
            let allocator = setup(2, 4);
            on_cpu(5);
            allocator.allocate();
        }
    }

    mod stealing {
        use super::*;

        #[test]
        fn empty_cpu_takes_the_only_page_of_another() {
            on_cpu(1);
            let allocator = setup(2, 1);
            let seeded = PhysicalAddress::new(KERNEL_PAGES * PAGE_SIZE);

            on_cpu(0);
            assert_eq!(allocator.allocate(), Some(seeded));

            assert_eq!(free_counts(&allocator), [0, 0]);
            assert_eq!(allocator.stats(CpuId::new(0)).steals, 1);
            assert_eq!(allocator.stats(CpuId::new(1)).stolen_from, 1);
            assert!(page_bytes(&allocator, seeded).iter().all(|&b| b == ALLOC_JUNK));
        }

        #[test]
        fn scans_in_index_order() {
            on_cpu(3);
            let allocator = setup(4, 8);
            let for_cpu1 = allocator.allocate().unwrap();
            let for_cpu2 = allocator.allocate().unwrap();
            on_cpu(2);
            allocator.free(for_cpu2);
            on_cpu(1);
            allocator.free(for_cpu1);

            assert_eq!(allocator.steal(CpuId::new(3)), Some(for_cpu1));
            assert_eq!(allocator.steal(CpuId::new(3)), Some(for_cpu2));
            assert_eq!(free_counts(&allocator), [0, 0, 0, 6]);
        }

        #[test]
        fn never_touches_the_excluded_pool() {
            on_cpu(3);
            let allocator = setup(4, 4);
            let before: Vec<_> = (0..4)
                .map(|cpu| allocator.stats(CpuId::new(cpu)).lock_acquisitions)
                .collect();

            assert!(allocator.steal(CpuId::new(2)).is_some());

            let after: Vec<_> = (0..4)
                .map(|cpu| allocator.stats(CpuId::new(cpu)).lock_acquisitions)
                .collect();
            assert_eq!(after[2], before[2]);
            assert_eq!(after[0], before[0] + 1);
            assert_eq!(after[1], before[1] + 1);
            assert_eq!(after[3], before[3] + 1);
        }

        #[test]
        fn allocating_cpu_locks_its_own_pool_once() {
            on_cpu(3);
            let allocator = setup(4, 4);

            on_cpu(2);
            let before = allocator.stats(CpuId::new(2)).lock_acquisitions;
            assert!(allocator.allocate().is_some());
            let after = allocator.stats(CpuId::new(2)).lock_acquisitions;

            assert_eq!(after, before + 1);
        }

        #[test]
        fn excluded_pool_may_stay_locked() {
            on_cpu(1);
            let allocator = setup(2, 2);

            let held = allocator.pool(CpuId::new(0)).lock();
            assert!(allocator.steal(CpuId::new(0)).is_some());
            drop(held);

            assert_eq!(free_counts(&allocator), [0, 1]);
        }

        #[test]
        fn every_pool_lock_is_taken_pinned() {
            on_cpu(1);
            let allocator = setup(3, 4);

            on_cpu(0);
            let stolen = allocator.allocate().unwrap();
            allocator.free(stolen);
            assert!(allocator.steal(CpuId::new(2)).is_some());
            assert_eq!(allocator.free_pages(), 3);
            assert_eq!(allocator.free_pages_on(CpuId::new(1)), 3);

            for pool in allocator.pools() {
                assert_eq!(pool.stats().unpinned_locks(), 0);
            }
        }

        #[test]
        fn nothing_to_steal_returns_none() {
            let allocator = setup(3, 2);
            assert_eq!(allocator.steal(CpuId::new(0)), None);
            assert_eq!(free_counts(&allocator), [2, 0, 0]);
        }
    }

    mod invalid_release {
        use super::*;

        #[test]
        #[should_panic(expected = "is not page-aligned")]
        fn rejects_misaligned_address() {
            let allocator = setup(2, 4);
            allocator.free(PhysicalAddress::new(KERNEL_PAGES * PAGE_SIZE + 8));
        }

        #[test]
        #[should_panic(expected = "is below kernel end")]
        fn rejects_address_below_kernel_end() {
            let allocator = setup(2, 4);
            allocator.free(PhysicalAddress::new((KERNEL_PAGES - 1) * PAGE_SIZE));
        }

        #[test]
        #[should_panic(expected = "is below kernel end")]
        fn rejects_page_holding_an_unaligned_kernel_end() {
            let range = MemoryRange::new(PAGE_SIZE + 8, 4 * PAGE_SIZE).unwrap();
            let allocator = PageAllocator::initialize(
                range,
                1,
                AddressTranslator::emulated(4 * PAGE_SIZE),
                EmulatedCpu::new(),
            )
            .unwrap();

            allocator.free(PhysicalAddress::new(PAGE_SIZE));
        }

        #[test]
        #[should_panic(expected = "is at or above physical top")]
        fn rejects_physical_top() {
            let allocator = setup(2, 4);
            allocator.free(allocator.range().physical_top());
        }

        #[test]
        fn rejected_release_leaves_every_list_alone() {
            let allocator = setup(2, 4);
            let kernel_end = allocator.range().kernel_end();
            let physical_top = allocator.range().physical_top();
            let before = free_counts(&allocator);

            for bad in [kernel_end - 1, kernel_end + 1, physical_top] {
                let result = catch_unwind(AssertUnwindSafe(|| allocator.free(bad)));
                assert!(result.is_err(), "free({bad}) should have panicked");
            }

            assert_eq!(free_counts(&allocator), before);
            assert_eq!(allocator.stats(CpuId::new(0)).frees, 4);
            assert!(allocator.pools().iter().all(|pool| !pool.is_locked()));
        }
    }

    mod concurrency {
        use super::*;

        const CPUS: usize = 4;

        #[test]
        fn concurrent_allocations_are_unique() {
            let allocator = setup(CPUS, 256);

            let mut pages: Vec<PhysicalAddress> = std::thread::scope(|s| {
                let workers: Vec<_> = (0..CPUS)
                    .map(|cpu| {
                        let allocator = &allocator;
                        s.spawn(move || {
                            on_cpu(cpu);
                            core::iter::from_fn(|| allocator.allocate()).collect::<Vec<_>>()
                        })
                    })
                    .collect();

                workers
                    .into_iter()
                    .flat_map(|worker| worker.join().unwrap())
                    .collect()
            });

            assert_eq!(pages.len(), 256);
            pages.sort();
            pages.dedup();
            assert_eq!(pages.len(), 256);
            assert_eq!(allocator.free_pages(), 0);
        }

        #[test]
        fn churn_across_cpus_conserves_pages() {
            let allocator = setup(CPUS, 32);

            std::thread::scope(|s| {
                for cpu in 0..CPUS {
                    let allocator = &allocator;
                    s.spawn(move || {
                        on_cpu(cpu);
                        for _ in 0..500 {
                            let held: Vec<_> =
                                (0..3).filter_map(|_| allocator.allocate()).collect();
                            for page in held {
                                allocator.free(page);
                            }
                        }
                    });
                }
            });

            assert_eq!(allocator.free_pages(), 32);
            let stolen: usize = (0..CPUS)
                .map(|cpu| allocator.stats(CpuId::new(cpu)).steals)
                .sum();
            let lost: usize = (0..CPUS)
                .map(|cpu| allocator.stats(CpuId::new(cpu)).stolen_from)
                .sum();
            assert_eq!(stolen, lost);
        }
    }
}
