//! AArch64 hardware implementation.
//!
//! Thin wrappers over the EL1 system registers and TLB maintenance instructions that the
//! engine needs. Register access goes through `aarch64-cpu`; TLBI and interrupt masking
//! have no register abstraction and use inline assembly.

use aarch64_cpu::registers::*;
use core::arch::asm;

use crate::AddressTranslator;

/// SCTLR_EL1.M: stage-1 translation enable.
const SCTLR_M: u64 = 1 << 0;
/// SCTLR_EL1.C: data cache enable.
const SCTLR_C: u64 = 1 << 2;
/// SCTLR_EL1.I: instruction cache enable.
const SCTLR_I: u64 = 1 << 12;

/// Reads the active TTBR0_EL1 value.
#[inline]
pub fn read_ttbr0() -> u64 {
    TTBR0_EL1.get()
}

/// Loads a new TTBR0_EL1 value.
///
/// The caller is responsible for TLB maintenance afterwards.
#[inline]
pub fn write_ttbr0(value: u64) {
    TTBR0_EL1.set(value);
    // SAFETY: an ISB has no memory effects.
    unsafe {
        asm!("isb", options(nostack, preserves_flags));
    }
}

/// Invalidates every EL1 TLB entry in the inner-shareable domain.
#[inline]
pub fn invalidate_tlb_all() {
    // SAFETY: TLB maintenance only discards cached translations.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidates the TLB entries for one page, for all ASIDs.
#[inline]
pub fn invalidate_tlb_page(virt: usize) {
    let page = (virt >> 12) as u64;
    // SAFETY: TLB maintenance only discards cached translations.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vaae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) page,
            options(nostack, preserves_flags)
        );
    }
}

/// Unmasks IRQs at the current exception level.
#[inline]
pub fn irq_enable() {
    // SAFETY: changing PSTATE.I is allowed at EL1.
    unsafe {
        asm!("msr daifclr, #2", options(nomem, nostack));
    }
}

/// Masks IRQs at the current exception level.
#[inline]
pub fn irq_disable() {
    // SAFETY: changing PSTATE.I is allowed at EL1.
    unsafe {
        asm!("msr daifset, #2", options(nomem, nostack));
    }
}

/// Programs the translation regime and turns the MMU on.
///
/// # Safety
///
/// The tables referenced by `ttbr0` must map everything the CPU touches after the MMU is
/// enabled, including the currently executing code and stack.
pub unsafe fn enable_mmu(mair: u64, tcr: u64, ttbr0: u64) {
    MAIR_EL1.set(mair);
    TCR_EL1.set(tcr);
    TTBR0_EL1.set(ttbr0);
    invalidate_tlb_all();

    SCTLR_EL1.set(SCTLR_EL1.get() | SCTLR_M | SCTLR_C | SCTLR_I);
    // SAFETY: an ISB has no memory effects.
    unsafe {
        asm!("isb", options(nostack, preserves_flags));
    }
}

/// Returns the physical address of the table pool that starts at `pool`.
#[inline]
pub fn pool_phys_base(pool: *const u8) -> usize {
    AddressTranslator::current().virt_to_phys(pool as usize)
}
