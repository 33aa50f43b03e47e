//! Errors reported while setting up the allocator.
//!
//! Misuse after setup (releasing a page the allocator does not manage) is a fatal
//! panic, and running out of pages is an empty `Option`; neither goes through here.

use core::fmt;

use crate::PhysicalAddress;

/// Errors that can occur when describing the memory the allocator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The kernel end lies above the top of physical memory.
    InvertedRange {
        kernel_end: PhysicalAddress,
        physical_top: PhysicalAddress,
    },
    /// An address exceeds the architecture's physical address width.
    AddressTooWide(usize),
    /// At least one CPU pool is required.
    NoCpus,
    /// More CPUs were requested than there are pools.
    TooManyCpus { requested: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvertedRange {
                kernel_end,
                physical_top,
            } => write!(
                f,
                "kernel end {kernel_end} is above physical top {physical_top}"
            ),
            Self::AddressTooWide(addr) => {
                write!(f, "address {addr:#x} exceeds the physical address width")
            }
            Self::NoCpus => write!(f, "at least one CPU is required"),
            Self::TooManyCpus { requested, max } => {
                write!(f, "{requested} CPUs requested but at most {max} are supported")
            }
        }
    }
}

impl core::error::Error for ConfigError {}
