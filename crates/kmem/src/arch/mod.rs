//! Architecture-specific support for the page allocator.
//!
//! The page size is shared by every architecture. The remaining pieces (physical
//! address width, how to pin a thread to its CPU) come either from the hardware
//! implementation or from the software emulation used by tests.

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

// NOTE: We DO include the hardware module during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::HardwareCpu;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::{CurrentCpu, validate_physical};

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Accepts any address that fits in a `usize` on targets without a dedicated implementation.
#[cfg(not(any(target_arch = "x86_64", test, feature = "software-emulation")))]
#[inline]
pub const fn validate_physical(_addr: usize) -> bool {
    true
}
