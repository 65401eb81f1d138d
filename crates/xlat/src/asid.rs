//! Address space identifiers and activation.

use core::fmt;

use log::{debug, warn};

use crate::arch;
use crate::config::AsidBits;
use crate::pool::TableHandle;
use crate::PhysicalAddress;

/// Bit position of the ASID in TTBR0_EL1.
const TTBR_ASID_SHIFT: u32 = 48;

/// An address space identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(u16);

impl Asid {
    /// The identifier of the kernel address space. Never assigned to a domain.
    pub const KERNEL: Self = Self(0);

    /// Returns the raw identifier.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out ASIDs in increasing order, starting over at 1 once the width is exhausted.
#[derive(Debug)]
pub(crate) struct AsidAllocator {
    next: u16,
    max: u16,
}

impl AsidAllocator {
    pub const fn new(bits: AsidBits) -> Self {
        Self {
            next: 1,
            max: bits.max_asid(),
        }
    }

    pub fn allocate(&mut self) -> Asid {
        let asid = Asid(self.next);
        if self.next == self.max {
            warn!("ASID space exhausted, wrapping around to 1");
            self.next = 1;
        } else {
            self.next += 1;
        }
        asid
    }
}

/// The root table of an address space and the TTBR0_EL1 value that activates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: TableHandle,
    ttbr0: u64,
}

impl AddressSpace {
    /// Creates an address space rooted at `root`, located at `root_phys`.
    pub const fn new(root: TableHandle, root_phys: PhysicalAddress, asid: Asid) -> Self {
        Self {
            root,
            ttbr0: ((asid.0 as u64) << TTBR_ASID_SHIFT) | root_phys.as_u64(),
        }
    }

    /// Returns the root table.
    pub const fn root(&self) -> TableHandle {
        self.root
    }

    /// Returns the ASID tagging this address space's translations.
    pub const fn asid(&self) -> Asid {
        Asid((self.ttbr0 >> TTBR_ASID_SHIFT) as u16)
    }

    /// Returns the TTBR0_EL1 value selecting this address space.
    pub const fn ttbr0(&self) -> u64 {
        self.ttbr0
    }

    /// Makes this the active address space on the current CPU.
    ///
    /// Returns whether TTBR0_EL1 had to change. Any change is followed by a full TLB
    /// invalidation, even when only the root and not the ASID differs.
    pub fn activate(&self) -> bool {
        if arch::read_ttbr0() == self.ttbr0 {
            return false;
        }

        debug!("switching to address space {} ({:#018x})", self.asid(), self.ttbr0);
        arch::write_ttbr0(self.ttbr0);
        arch::invalidate_tlb_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulated;

    #[test]
    fn allocation_skips_kernel_asid() {
        let mut asids = AsidAllocator::new(AsidBits::Eight);
        assert_eq!(asids.allocate().value(), 1);
        assert_eq!(asids.allocate().value(), 2);
    }

    #[test]
    fn eight_bit_asids_wrap_to_one() {
        let mut asids = AsidAllocator::new(AsidBits::Eight);
        for expected in 1..=255 {
            assert_eq!(asids.allocate().value(), expected);
        }
        assert_eq!(asids.allocate().value(), 1);
        assert_eq!(asids.allocate().value(), 2);
    }

    #[test]
    fn sixteen_bit_asids_go_past_255() {
        let mut asids = AsidAllocator::new(AsidBits::Sixteen);
        let last = (0..256).map(|_| asids.allocate()).last();
        assert_eq!(last, Some(Asid(256)));
    }

    #[test]
    fn ttbr0_packing() {
        let space = AddressSpace::new(
            TableHandle::from_index(3),
            PhysicalAddress::new(0x8000_3000),
            Asid(0x42),
        );
        assert_eq!(space.ttbr0(), 0x0042_0000_8000_3000);
        assert_eq!(space.asid(), Asid(0x42));
        assert_eq!(space.root(), TableHandle::from_index(3));
    }

    #[test]
    fn activation_invalidates_only_on_change() {
        let space = AddressSpace::new(
            TableHandle::from_index(1),
            PhysicalAddress::new(0x8000_1000),
            Asid(7),
        );
        let flushes = emulated::tlb_full_invalidations();

        assert!(space.activate());
        assert_eq!(emulated::read_ttbr0(), space.ttbr0());
        assert_eq!(emulated::tlb_full_invalidations(), flushes + 1);

        assert!(!space.activate());
        assert_eq!(emulated::tlb_full_invalidations(), flushes + 1);
    }

    #[test]
    fn same_asid_new_root_still_invalidates() {
        let a = AddressSpace::new(TableHandle::from_index(1), PhysicalAddress::new(0x8000_1000), Asid(7));
        let b = AddressSpace::new(TableHandle::from_index(2), PhysicalAddress::new(0x8000_2000), Asid(7));
        a.activate();
        let flushes = emulated::tlb_full_invalidations();

        assert!(b.activate());
        assert_eq!(emulated::tlb_full_invalidations(), flushes + 1);
    }
}
