//! Address types for physical and virtual memory.
//!
//! Translation tables only ever store physical addresses, while the engine itself
//! touches the table pool through kernel virtual addresses. These newtypes keep the
//! two apart.

use core::fmt;
use core::ops::Add;

use crate::arch;

/// Converts kernel virtual addresses of engine-owned memory into physical addresses.
///
/// The table pool lives in kernel memory but has to be referenced from descriptors by
/// its physical address. The translator describes how the kernel reaches physical
/// memory:
/// - Identity: virtual == physical (the common case for small RTOS kernels)
/// - DirectMap: all physical memory is mapped at a fixed virtual offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTranslator {
    /// Kernel memory is identity mapped.
    Identity,
    /// Physical memory is mapped at `direct_map_offset`.
    DirectMap { direct_map_offset: usize },
}

impl AddressTranslator {
    /// Creates a translator for a direct-mapped kernel.
    pub const fn direct_map(direct_map_offset: usize) -> Self {
        Self::DirectMap { direct_map_offset }
    }

    /// Sets the global address translator.
    ///
    /// This function must be called at most once, before the first table is linked.
    /// Without it the kernel is assumed to be identity mapped.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        if ADDRESS_TRANSLATOR.get().is_some() {
            panic!("address translator already set");
        }
        ADDRESS_TRANSLATOR.call_once(|| translator);
    }

    /// Returns the current global address translator.
    pub fn current() -> AddressTranslator {
        ADDRESS_TRANSLATOR
            .get()
            .copied()
            .unwrap_or(AddressTranslator::Identity)
    }

    /// Translates a physical address to a kernel virtual address.
    pub const fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Identity => phys,
            Self::DirectMap { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
        }
    }

    /// Translates a kernel virtual address to a physical address.
    pub const fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Identity => virt,
            Self::DirectMap { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
        }
    }
}

static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

/// Generates the parts shared by physical and virtual addresses.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a 64-bit descriptor field.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are what descriptors store: output addresses of blocks and\n\
     pages, and the location of next-level tables."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's output address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Only the lower (TTBR0) half is managed by the engine; upper-half addresses are\n\
     representable but rejected by the mapping operations."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for a 48-bit address space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }
}
