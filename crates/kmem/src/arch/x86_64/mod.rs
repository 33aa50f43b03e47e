//! x86_64 hardware implementation.
//!
//! Pinning is done by disabling interrupts for the duration of the critical section;
//! with interrupts off the scheduler cannot preempt the thread and move it to
//! another CPU. The CPU index is read from `IA32_TSC_AUX`, which boot code
//! programs with the logical CPU number on every CPU (the same convention Linux
//! uses for `rdtscp`/`rdpid`).

use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::Msr;

use crate::{CpuId, CpuLocal};

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Model-specific register holding the logical CPU number.
const IA32_TSC_AUX: u32 = 0xC000_0103;

/// The CPU pinning implementation used by the global allocator on this architecture.
pub type CurrentCpu = HardwareCpu;

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Pins critical sections to the current CPU by masking interrupts.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareCpu;

impl HardwareCpu {
    /// Creates the hardware pinning handle.
    pub const fn new() -> Self {
        Self
    }

    /// Reads the logical CPU number programmed into `IA32_TSC_AUX`.
    ///
    /// # Safety
    ///
    /// Must run in ring 0 after boot code has programmed the MSR on this CPU.
    unsafe fn read_cpu_number() -> usize {
        let msr = Msr::new(IA32_TSC_AUX);
        // SAFETY: forwarded to the caller.
        unsafe { msr.read() as usize }
    }
}

impl CpuLocal for HardwareCpu {
    fn pinned<R>(&self, f: impl FnOnce(CpuId) -> R) -> R {
        interrupts::without_interrupts(|| {
            // SAFETY: the allocator only runs in the kernel, after per-CPU bring-up.
            let cpu = unsafe { Self::read_cpu_number() };
            f(CpuId::new(cpu))
        })
    }
}
