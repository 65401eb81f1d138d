//! Architecture-specific CPU operations.
//!
//! The translation tables themselves are plain memory and handled by portable code. What
//! differs between running on real hardware and running on a development host is the CPU
//! side: system registers, TLB maintenance and interrupt masking. This module selects
//! either the AArch64 hardware implementation or the software emulation.

// Use the AArch64 hardware implementation when we're on AArch64 and not testing or emulating.
#[cfg(all(target_arch = "aarch64", not(test), not(feature = "software-emulation")))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", not(test), not(feature = "software-emulation")))]
pub use aarch64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{
    enable_mmu, invalidate_tlb_all, invalidate_tlb_page, irq_disable, irq_enable, pool_phys_base,
    read_ttbr0, write_ttbr0,
};
#[cfg(any(test, feature = "software-emulation"))]
pub use software as emulated;

#[cfg(not(any(target_arch = "aarch64", test, feature = "software-emulation")))]
compile_error!("xlat needs target_arch = \"aarch64\" or the `software-emulation` feature");

/// Maximum number of bits in an output (physical) address with 4 KiB granules.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a TTBR0 virtual address.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB granule).
pub const PAGE_SIZE: usize = 4096;

/// Validates a physical address against the output address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Validates a virtual address.
///
/// Virtual addresses must be canonical: bits 48-63 are all zero (TTBR0 half) or all one
/// (TTBR1 half).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let top = addr >> MAX_VIRTUAL_BITS;
    top == 0 || top == (usize::MAX >> MAX_VIRTUAL_BITS)
}
