#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # xlat
//!
//! Stage-1 translation table manager for AArch64 (4 KiB granule). It provides:
//!
//! - A fixed-capacity pool of translation tables with packed owner/occupancy accounting.
//! - Mapping and unmapping of virtual ranges with block promotion and block splitting.
//! - Memory domains: per-domain address spaces that share the kernel's tables until a
//!   range is privatized, and merge back when it is globalized again.
//! - ASID assignment and TTBR0 activation on context switch.
//! - The architecture half of demand paging (page out/in, accessed/dirty tracking).
//! - Software emulation of the CPU side for testing in non-kernel environments.

mod address;
mod arch;
mod asid;
mod config;
mod descriptor;
mod domain;
mod error;
mod isolation;
mod mapping;
mod mmu;
#[cfg(feature = "demand-paging")]
mod paging;
mod pool;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use asid::{AddressSpace, Asid};
pub use config::{AsidBits, MAIR_VALUE, MmuConfig};
pub use descriptor::{Attributes, DescAttrs, Descriptor, Level, MemoryFlags, MemoryType};
pub use domain::{DomainId, MAX_DOMAINS, Scheduler, StackRegion, Thread, ThreadRoot};
pub use error::{MmuError, TranslateError};
pub use mapping::Overwrite;
pub use mmu::{Mmu, MmuRegion};
#[cfg(feature = "demand-paging")]
pub use paging::{
    EvictionPolicy, FaultContext, FaultResolver, PageInfo, PageLocation, PageState, Syndrome,
};
pub use pool::{ENTRIES_PER_TABLE, PoolStats, TableHandle, Usage};

pub use arch::PAGE_SIZE;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::emulated;
