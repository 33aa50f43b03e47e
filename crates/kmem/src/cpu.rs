//! CPU identity and pinning.

use core::fmt;

/// Maximum number of CPUs the allocator keeps pools for.
pub const MAX_CPUS: usize = 8;

/// A logical CPU index, `0..cpu_count`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a CPU index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw CPU index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuId({})", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<usize> for CpuId {
    #[inline]
    fn from(index: usize) -> Self {
        Self(index)
    }
}

/// Runs code pinned to the CPU the caller is executing on.
///
/// The identity passed to the closure stays valid until the closure returns: the
/// implementation must keep the thread from migrating to another CPU in between.
/// The allocator acquires and releases the current CPU's pool lock entirely inside
/// one pinned section, so the lock it takes always protects the list it reads.
pub trait CpuLocal {
    /// Calls `f` with the current CPU's index while migration is suspended.
    fn pinned<R>(&self, f: impl FnOnce(CpuId) -> R) -> R;
}
