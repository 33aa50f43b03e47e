//! Per-CPU pool: one lock, one free list, and counters describing how it is used.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::free_list::FreeList;

/// A CPU's private pool of free pages.
pub(crate) struct CpuPool {
    list: Mutex<FreeList>,
    stats: PoolStats,
}

impl CpuPool {
    /// Creates a pool with an empty free list.
    pub(crate) const fn new() -> Self {
        Self {
            list: Mutex::new(FreeList::new()),
            stats: PoolStats::new(),
        }
    }

    /// Acquires the pool's lock, spinning until it is available.
    ///
    /// Every access to the free list, even reading its length, goes through here.
    /// Callers hold the lock only inside a [`CpuLocal::pinned`](crate::CpuLocal::pinned)
    /// section; a holder that migrates with the lock held could leave another CPU
    /// spinning on it with interrupts masked.
    pub(crate) fn lock(&self) -> MutexGuard<'_, FreeList> {
        let guard = self.list.lock();
        self.stats.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        #[cfg(test)]
        if !crate::arch::is_pinned() {
            self.stats.unpinned_locks.fetch_add(1, Ordering::Relaxed);
        }
        guard
    }

    /// Returns true if some CPU currently holds this pool's lock.
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.list.is_locked()
    }

    /// Returns the number of free pages in the pool. Callers must be pinned.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// Usage counters for one pool.
///
/// Counters are updated with relaxed atomics outside of any ordering guarantee; a
/// snapshot taken while other CPUs are busy is approximate.
pub(crate) struct PoolStats {
    lock_acquisitions: AtomicUsize,
    local_allocations: AtomicUsize,
    frees: AtomicUsize,
    stolen_from: AtomicUsize,
    steals: AtomicUsize,
    #[cfg(test)]
    unpinned_locks: AtomicUsize,
}

impl PoolStats {
    const fn new() -> Self {
        Self {
            lock_acquisitions: AtomicUsize::new(0),
            local_allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            stolen_from: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
            #[cfg(test)]
            unpinned_locks: AtomicUsize::new(0),
        }
    }

    /// Lock acquisitions made outside a pinned section.
    #[cfg(test)]
    pub(crate) fn unpinned_locks(&self) -> usize {
        self.unpinned_locks.load(Ordering::Relaxed)
    }

    pub(crate) fn record_local_allocation(&self) {
        self.local_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stolen_from(&self) {
        self.stolen_from.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            local_allocations: self.local_allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            stolen_from: self.stolen_from.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a pool's usage counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Times the pool's lock was acquired, by its own CPU or by a thief.
    pub lock_acquisitions: usize,
    /// Pages this CPU allocated from its own pool.
    pub local_allocations: usize,
    /// Pages released into this pool (including initial seeding).
    pub frees: usize,
    /// Pages other CPUs took from this pool.
    pub stolen_from: usize,
    /// Pages this CPU took from other pools.
    pub steals: usize,
}
