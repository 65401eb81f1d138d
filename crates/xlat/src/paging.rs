//! Demand paging support.
//!
//! A page in the demand-paged window is in one of four states, encoded in its last-level
//! descriptor:
//!
//! | State                   | Type    | AF | AP_RO |
//! |-------------------------|---------|----|-------|
//! | present, not accessed   | page    | 0  | 1     |
//! | present, accessed       | page    | 1  | 1     |
//! | present, dirty          | page    | 1  | 0     |
//! | paged out               | invalid | -  | 1     |
//!
//! Pages come in clean and not accessed. The first access takes an access flag fault,
//! the first write a permission fault; both are resolved here and reported to the
//! eviction policy. Whether a page may become dirty at all is recorded in the
//! software-writable bit, independent of the hardware read-only bit.

use bitflags::bitflags;
use log::{debug, trace};

use crate::arch::{self, PAGE_SIZE};
use crate::descriptor::{DescAttrs, Descriptor, Level};
use crate::mmu::Mmu;
use crate::pool::TableHandle;
use crate::{PhysicalAddress, VirtualAddress};

/// Exception class: instruction abort taken without a change in exception level.
const EC_INSTRUCTION_ABORT_CURRENT_EL: u64 = 0x21;
/// Exception class: data abort taken without a change in exception level.
const EC_DATA_ABORT_CURRENT_EL: u64 = 0x25;

/// Fault status code of an access flag fault, without the level.
const FSC_ACCESS_FLAG: u64 = 0b0010_00;
/// Fault status code of a permission fault, without the level.
const FSC_PERMISSION: u64 = 0b0011_00;
/// Level encoded in the fault status code of faults on last-level entries.
const FSC_LAST_LEVEL: u64 = 3;

/// SPSR_EL1.I: IRQs were masked when the exception was taken.
const SPSR_IRQ_MASKED: u64 = 1 << 7;

/// The eviction algorithm's view of page accesses.
pub trait EvictionPolicy {
    /// Called when the page frame at `phys` was accessed.
    fn accessed(&self, phys: PhysicalAddress);
}

/// The generic page fault handler, which loads pages that are not present.
pub trait FaultResolver {
    /// Resolves a fault on the page at `virt`. Returns whether the access can be retried.
    fn resolve(&self, virt: VirtualAddress) -> bool;
}

/// Where the contents of a page currently are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    /// The address is not mapped by a last-level entry.
    Bad,
    /// The page is present in the given frame.
    PagedIn(PhysicalAddress),
    /// The page is stored at the given backing-store location.
    PagedOut(usize),
}

bitflags! {
    /// State of a data page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u32 {
        /// The page was accessed since the flag was last cleared.
        const ACCESSED = 1 << 0;
        /// The page was written to since it was paged in.
        const DIRTY = 1 << 1;
        /// The page is present.
        const LOADED = 1 << 2;
        /// The address is not mapped at all.
        const NOT_MAPPED = 1 << 3;
    }
}

/// State and address of a data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub state: PageState,
    /// The page frame when loaded, the backing-store location when paged out, 0 otherwise.
    pub address: usize,
}

/// Registers saved when a synchronous exception was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    /// ESR_EL1.
    pub esr: u64,
    /// FAR_EL1.
    pub far: usize,
    /// SPSR_EL1.
    pub spsr: u64,
}

impl FaultContext {
    /// Returns the decoded exception syndrome.
    pub const fn syndrome(&self) -> Syndrome {
        Syndrome(self.esr)
    }

    /// Returns whether IRQs were unmasked when the fault was taken.
    pub const fn irqs_were_enabled(&self) -> bool {
        self.spsr & SPSR_IRQ_MASKED == 0
    }
}

/// Decoded exception syndrome (ESR_EL1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syndrome(pub u64);

impl Syndrome {
    /// Returns the exception class.
    pub const fn exception_class(self) -> u64 {
        (self.0 >> 26) & 0x3F
    }

    /// Returns the instruction specific syndrome.
    pub const fn iss(self) -> u64 {
        self.0 & 0x1FF_FFFF
    }

    /// Returns the fault status code of an abort.
    pub const fn fault_status(self) -> u64 {
        self.iss() & 0x3F
    }

    /// Returns whether a data abort was caused by a write.
    pub const fn is_write(self) -> bool {
        self.iss() & (1 << 6) != 0
    }

    /// Returns whether this is an instruction or data abort from the current level.
    pub const fn is_current_el_abort(self) -> bool {
        matches!(
            self.exception_class(),
            EC_INSTRUCTION_ABORT_CURRENT_EL | EC_DATA_ABORT_CURRENT_EL
        )
    }

    /// Returns whether this is an access flag fault on a last-level entry.
    pub const fn is_access_flag_fault(self) -> bool {
        self.fault_status() == FSC_ACCESS_FLAG | FSC_LAST_LEVEL
    }

    /// Returns whether this is a permission fault on a last-level entry.
    pub const fn is_permission_fault(self) -> bool {
        self.fault_status() == FSC_PERMISSION | FSC_LAST_LEVEL
    }
}

impl<const N: usize> Mmu<N> {
    /// Marks the page at `virt` as paged out to `location`.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not mapped by a last-level entry, or if `location` does not fit
    /// the output address field.
    pub fn page_out(&self, virt: VirtualAddress, location: usize) {
        self.rewrite_page(virt, |descriptor| {
            let attrs = descriptor.attrs().unwrap_or_else(|| {
                panic!("page_out: {virt} is not mapped")
            });
            Descriptor::Invalid {
                location,
                attrs: attrs | DescAttrs::AP_RO,
            }
        });
        debug!("paged out {virt} to {location:#x}");
    }

    /// Marks the page at `virt` as present in the frame at `phys`, clean and not
    /// accessed.
    ///
    /// # Panics
    ///
    /// Panics if the page is not paged out.
    pub fn page_in(&self, virt: VirtualAddress, phys: PhysicalAddress) {
        self.rewrite_page(virt, |descriptor| match descriptor {
            Descriptor::Invalid { attrs, .. } => Descriptor::Page {
                phys,
                attrs: (attrs | DescAttrs::AP_RO) - DescAttrs::AF,
            },
            other => panic!("page_in: {virt} is not paged out ({other:?})"),
        });
        debug!("paged in {virt} from {phys}");
    }

    /// Returns where the contents of the page at `virt` are.
    pub fn page_location(&self, virt: VirtualAddress) -> PageLocation {
        let (_, xlat) = self.lock();
        let Some((table, index)) =
            xlat.pool
                .leaf_slot(TableHandle::KERNEL_ROOT, xlat.level, virt.as_usize())
        else {
            return PageLocation::Bad;
        };

        match xlat.pool.read(table, index, Level::L3) {
            Descriptor::Page { phys, .. } => PageLocation::PagedIn(phys),
            Descriptor::Invalid { location, .. } => PageLocation::PagedOut(location),
            _ => PageLocation::Bad,
        }
    }

    /// Returns the state of the page at `virt`, optionally clearing its accessed flag.
    pub fn page_info(&self, virt: VirtualAddress, clear_accessed: bool) -> PageInfo {
        let not_mapped = PageInfo {
            state: PageState::NOT_MAPPED,
            address: 0,
        };

        let virt = virt.align_down(PAGE_SIZE);
        let (domains, mut xlat) = self.lock();
        let Some((table, index)) =
            xlat.pool
                .leaf_slot(TableHandle::KERNEL_ROOT, xlat.level, virt.as_usize())
        else {
            return not_mapped;
        };

        let (phys, attrs) = match xlat.pool.read(table, index, Level::L3) {
            Descriptor::Page { phys, attrs } => (phys, attrs),
            Descriptor::Invalid { location, .. } => {
                return PageInfo {
                    state: PageState::empty(),
                    address: location,
                };
            }
            _ => return not_mapped,
        };

        let mut state = PageState::LOADED;
        if attrs.contains(DescAttrs::AF) {
            state |= PageState::ACCESSED;
        }
        if !attrs.contains(DescAttrs::AP_RO) {
            state |= PageState::DIRTY;
        }

        if clear_accessed {
            let page = Descriptor::Page {
                phys,
                attrs: attrs - DescAttrs::AF,
            };
            xlat.pool.write(table, index, Level::L3, page);
            xlat.sync_domains(&domains, virt.as_usize(), PAGE_SIZE);
            arch::invalidate_tlb_page(virt.as_usize());
        }

        PageInfo {
            state,
            address: phys.as_usize(),
        }
    }

    /// Handles a synchronous abort in the demand-paged window.
    ///
    /// Access flag faults and write faults on clean writable pages are resolved here.
    /// Faults on pages that are not present are passed to `resolver`, with IRQs unmasked
    /// during the call if they were unmasked when the fault was taken.
    ///
    /// Returns whether the faulting access can be retried.
    pub fn handle_fault(
        &self,
        context: FaultContext,
        eviction: &impl EvictionPolicy,
        resolver: &impl FaultResolver,
    ) -> bool {
        let syndrome = context.syndrome();
        if !syndrome.is_current_el_abort() || !self.config().in_virt_ram(context.far) {
            return false;
        }

        let virt = context.far & !(PAGE_SIZE - 1);
        match self.resolve_present(virt, syndrome) {
            Resolution::Done(phys) => {
                eviction.accessed(phys);
                true
            }
            Resolution::Unhandled => false,
            Resolution::NotPresent => {
                if context.irqs_were_enabled() {
                    arch::irq_enable();
                }
                let resolved = resolver.resolve(VirtualAddress::new(virt));
                arch::irq_disable();
                resolved
            }
        }
    }

    fn resolve_present(&self, virt: usize, syndrome: Syndrome) -> Resolution {
        let (domains, mut xlat) = self.lock();
        let level = xlat.level;
        let Some((table, index)) = xlat.pool.leaf_slot(TableHandle::KERNEL_ROOT, level, virt) else {
            return Resolution::NotPresent;
        };
        let Descriptor::Page { phys, mut attrs } = xlat.pool.read(table, index, Level::L3) else {
            return Resolution::NotPresent;
        };
        let write = syndrome.is_write();

        if syndrome.is_access_flag_fault() && !attrs.contains(DescAttrs::AF) {
            attrs |= DescAttrs::AF;
            if write {
                if !attrs.contains(DescAttrs::SW_WRITABLE) {
                    return Resolution::Unhandled;
                }
                // Dirty it right away instead of taking a permission fault next.
                attrs -= DescAttrs::AP_RO;
            }
            xlat.pool
                .write(table, index, Level::L3, Descriptor::Page { phys, attrs });
            xlat.sync_domains(&domains, virt, PAGE_SIZE);
            trace!("page {virt:#x} accessed");
            return Resolution::Done(phys);
        }

        if syndrome.is_permission_fault()
            && write
            && attrs.contains(DescAttrs::AP_RO | DescAttrs::SW_WRITABLE)
        {
            attrs -= DescAttrs::AP_RO;
            xlat.pool
                .write(table, index, Level::L3, Descriptor::Page { phys, attrs });
            xlat.sync_domains(&domains, virt, PAGE_SIZE);
            arch::invalidate_tlb_page(virt);
            trace!("page {virt:#x} dirtied");
            return Resolution::Done(phys);
        }

        Resolution::Unhandled
    }

    /// Replaces the kernel's last-level entry for `virt` and carries the change into
    /// every domain.
    fn rewrite_page(&self, virt: VirtualAddress, rewrite: impl FnOnce(Descriptor) -> Descriptor) {
        assert!(virt.is_aligned(PAGE_SIZE), "page address {virt} is not aligned");

        let (domains, mut xlat) = self.lock();
        let level = xlat.level;
        let Some((table, index)) =
            xlat.pool
                .leaf_slot(TableHandle::KERNEL_ROOT, level, virt.as_usize())
        else {
            panic!("{virt} is not mapped by a page");
        };

        let descriptor = rewrite(xlat.pool.read(table, index, Level::L3));
        xlat.pool.write(table, index, Level::L3, descriptor);
        xlat.sync_domains(&domains, virt.as_usize(), PAGE_SIZE);
        arch::invalidate_tlb_page(virt.as_usize());
    }
}

/// Outcome of trying to resolve a fault on a present page.
enum Resolution {
    /// Resolved; the page frame was accessed.
    Done(PhysicalAddress),
    /// Not a fault this module resolves.
    Unhandled,
    /// No page is present at the address.
    NotPresent,
}
