#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # kmem
//!
//! A physical page allocator for the kernel. Every CPU owns a private pool of free
//! 4 KiB pages behind its own lock, so the common case (allocate and free on a CPU
//! that has spare pages) touches exactly one lock. When a CPU's pool runs dry, the
//! allocator steals a page from another CPU's pool, holding at most one lock at a
//! time.
//!
//! - [`PageAllocator`] is the allocator itself, usable as an isolated instance.
//! - [`global`] holds the process-wide instance the kernel installs at boot.
//! - [`CpuLocal`] abstracts "run this with the thread pinned to the current CPU".
//! - Software emulation of physical memory and CPU identity for host testing.

mod address;
mod arch;
mod cpu;
mod error;
mod free_list;
#[cfg(any(target_arch = "x86_64", test, feature = "software-emulation"))]
pub mod global;
mod page_allocator;
mod pool;
mod range;

pub use address::{AddressTranslator, PhysicalAddress};
pub use cpu::{CpuId, CpuLocal, MAX_CPUS};
pub use error::ConfigError;
pub use free_list::{ALLOC_JUNK, FREE_JUNK};
pub use page_allocator::PageAllocator;
pub use pool::PoolSnapshot;
pub use range::{MemoryRange, PageRange};

pub use arch::PAGE_SIZE;

#[cfg(target_arch = "x86_64")]
pub use arch::HardwareCpu;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedCpu, EmulatedMemory, current_cpu, set_current_cpu};
