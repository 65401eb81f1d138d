//! Software emulation of the CPU side for testing and development.
//!
//! The emulated CPU records everything the engine would do to real system registers so
//! tests can assert on it: the active TTBR0 value, the programmed MAIR/TCR, whether the
//! MMU was enabled, the interrupt mask, and how many TLB invalidations were issued.
//!
//! State is thread-local so that every test (each running on its own thread) observes an
//! independent CPU.

use core::cell::Cell;

/// Physical address at which the emulated table pool appears to live.
///
/// Host pointers are not meaningful physical addresses, so the pool is given a fixed,
/// 4 KiB-aligned physical window instead.
pub const EMULATED_POOL_BASE: usize = 0x8000_0000;

/// Emulated EL1 system state.
struct EmulatedCpu {
    ttbr0: Cell<u64>,
    mair: Cell<u64>,
    tcr: Cell<u64>,
    mmu_enabled: Cell<bool>,
    irqs_enabled: Cell<bool>,
    tlb_all: Cell<usize>,
    tlb_pages: Cell<usize>,
    last_tlb_page: Cell<Option<usize>>,
}

impl EmulatedCpu {
    const fn new() -> Self {
        Self {
            ttbr0: Cell::new(0),
            mair: Cell::new(0),
            tcr: Cell::new(0),
            mmu_enabled: Cell::new(false),
            irqs_enabled: Cell::new(false),
            tlb_all: Cell::new(0),
            tlb_pages: Cell::new(0),
            last_tlb_page: Cell::new(None),
        }
    }
}

std::thread_local! {
    static CPU: EmulatedCpu = const { EmulatedCpu::new() };
}

/// Reads the emulated TTBR0_EL1.
pub fn read_ttbr0() -> u64 {
    CPU.with(|cpu| cpu.ttbr0.get())
}

/// Writes the emulated TTBR0_EL1.
pub fn write_ttbr0(value: u64) {
    CPU.with(|cpu| cpu.ttbr0.set(value));
}

/// Records a full TLB invalidation.
pub fn invalidate_tlb_all() {
    CPU.with(|cpu| cpu.tlb_all.set(cpu.tlb_all.get() + 1));
}

/// Records a single-page TLB invalidation.
pub fn invalidate_tlb_page(virt: usize) {
    CPU.with(|cpu| {
        cpu.tlb_pages.set(cpu.tlb_pages.get() + 1);
        cpu.last_tlb_page.set(Some(virt));
    });
}

/// Unmasks emulated IRQs.
pub fn irq_enable() {
    CPU.with(|cpu| cpu.irqs_enabled.set(true));
}

/// Masks emulated IRQs.
pub fn irq_disable() {
    CPU.with(|cpu| cpu.irqs_enabled.set(false));
}

/// Records the translation regime and marks the MMU as enabled.
///
/// # Safety
///
/// Always safe in emulation; the signature matches the hardware implementation.
pub unsafe fn enable_mmu(mair: u64, tcr: u64, ttbr0: u64) {
    CPU.with(|cpu| {
        cpu.mair.set(mair);
        cpu.tcr.set(tcr);
        cpu.ttbr0.set(ttbr0);
        cpu.mmu_enabled.set(true);
    });
    invalidate_tlb_all();
}

/// Returns the emulated physical address of the table pool.
pub fn pool_phys_base(_pool: *const u8) -> usize {
    EMULATED_POOL_BASE
}

/// Returns the programmed MAIR_EL1 value.
pub fn mair() -> u64 {
    CPU.with(|cpu| cpu.mair.get())
}

/// Returns the programmed TCR_EL1 value.
pub fn tcr() -> u64 {
    CPU.with(|cpu| cpu.tcr.get())
}

/// Returns whether `enable_mmu` has been called on this thread.
pub fn mmu_enabled() -> bool {
    CPU.with(|cpu| cpu.mmu_enabled.get())
}

/// Returns whether emulated IRQs are currently unmasked.
pub fn irqs_enabled() -> bool {
    CPU.with(|cpu| cpu.irqs_enabled.get())
}

/// Returns the number of full TLB invalidations issued on this thread.
pub fn tlb_full_invalidations() -> usize {
    CPU.with(|cpu| cpu.tlb_all.get())
}

/// Returns the number of single-page TLB invalidations issued on this thread.
pub fn tlb_page_invalidations() -> usize {
    CPU.with(|cpu| cpu.tlb_pages.get())
}

/// Returns the address passed to the most recent single-page invalidation.
pub fn last_tlb_page() -> Option<usize> {
    CPU.with(|cpu| cpu.last_tlb_page.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttbr0_round_trip() {
        write_ttbr0(0x0001_0000_8000_0000);
        assert_eq!(read_ttbr0(), 0x0001_0000_8000_0000);
    }

    #[test]
    fn counts_invalidations() {
        let before = tlb_full_invalidations();
        invalidate_tlb_all();
        invalidate_tlb_page(0x7000);
        assert_eq!(tlb_full_invalidations(), before + 1);
        assert_eq!(last_tlb_page(), Some(0x7000));
    }

    #[test]
    fn irq_mask() {
        irq_enable();
        assert!(irqs_enabled());
        irq_disable();
        assert!(!irqs_enabled());
    }
}
