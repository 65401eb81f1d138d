//! Translation table descriptors.
//!
//! Tables hold raw 64-bit hardware descriptors. Everything above this module works with
//! the typed [`Descriptor`] instead; the bit layout is only touched by
//! [`Descriptor::decode`] and [`Descriptor::encode`].

use bitflags::bitflags;

use crate::{PhysicalAddress, TableHandle};

/// Number of bits resolved per translation level with 4 KiB granules.
const BITS_PER_LEVEL: usize = 9;

/// Descriptor type field, bits 0 and 1.
const TYPE_MASK: u64 = 0b11;
const TYPE_INVALID: u64 = 0b00;
const TYPE_BLOCK: u64 = 0b01;
const TYPE_TABLE_OR_PAGE: u64 = 0b11;

/// Output address field, bits 12 to 47.
pub(crate) const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Lower (2-11) and upper (52-63) attribute fields.
const ATTRIBUTES_MASK: u64 = 0xFFF0_0000_0000_0FFC;

/// A level of the translation table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// 512 GiB per entry; tables only.
    L0,
    /// 1 GiB per entry.
    L1,
    /// 2 MiB per entry.
    L2,
    /// 4 KiB per entry; pages only.
    L3,
}

impl Level {
    /// Returns the shift of the virtual address bits this level indexes by.
    pub const fn shift(self) -> usize {
        match self {
            Self::L0 => 39,
            Self::L1 => 30,
            Self::L2 => 21,
            Self::L3 => 12,
        }
    }

    /// Returns the span of virtual memory covered by one entry at this level.
    pub const fn block_size(self) -> usize {
        1 << self.shift()
    }

    /// Returns the table index of `virt` at this level.
    pub const fn index(self, virt: usize) -> usize {
        (virt >> self.shift()) & ((1 << BITS_PER_LEVEL) - 1)
    }

    /// Returns the next (finer) level, if any.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L0 => Some(Self::L1),
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }

    /// Returns the level of the tables referenced from this level.
    ///
    /// # Panics
    ///
    /// Panics at the last level, which cannot reference tables.
    pub(crate) const fn child(self) -> Self {
        match self.next() {
            Some(level) => level,
            None => panic!("no translation level below L3"),
        }
    }

    /// Returns whether this is the last level of the hierarchy.
    pub const fn is_last(self) -> bool {
        matches!(self, Self::L3)
    }

    /// Returns whether an entry at this level may map memory directly.
    pub const fn can_hold_block(self) -> bool {
        !matches!(self, Self::L0)
    }
}

/// Memory types, in MAIR_EL1 attribute index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Device, non-gathering, non-reordering, no early write acknowledgement.
    DeviceNgnrne,
    /// Device, non-gathering, non-reordering, early write acknowledgement.
    DeviceNgnre,
    /// Device, gathering, reordering, early write acknowledgement.
    DeviceGre,
    /// Normal memory, non-cacheable.
    NormalNonCacheable,
    /// Normal memory, write-back cacheable.
    Normal,
    /// Normal memory, write-through cacheable.
    NormalWriteThrough,
}

impl MemoryType {
    /// Returns the MAIR_EL1 attribute index of this type.
    pub const fn attr_index(self) -> u64 {
        match self {
            Self::DeviceNgnrne => 0,
            Self::DeviceNgnre => 1,
            Self::DeviceGre => 2,
            Self::NormalNonCacheable => 3,
            Self::Normal => 4,
            Self::NormalWriteThrough => 5,
        }
    }

    /// Returns whether this is one of the device memory types.
    pub const fn is_device(self) -> bool {
        matches!(self, Self::DeviceNgnrne | Self::DeviceNgnre | Self::DeviceGre)
    }
}

bitflags! {
    /// Access and behavior flags of a mapping, independent of the descriptor format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        /// Writable. Read-only when clear.
        const WRITE = 1 << 0;
        /// Accessible from EL0 with the same permissions as the kernel.
        const USER = 1 << 1;
        /// Non-secure output address.
        const NON_SECURE = 1 << 2;
        /// Not executable at EL1.
        const PRIVILEGED_EXECUTE_NEVER = 1 << 3;
        /// Not executable at EL0.
        const USER_EXECUTE_NEVER = 1 << 4;
        /// Translation is tagged with the ASID.
        const NON_GLOBAL = 1 << 5;
        /// Page is not resident; the output address is a backing-store location.
        const PAGED_OUT = 1 << 6;
    }
}

/// Memory type and flags describing a region to be mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub memory_type: MemoryType,
    pub flags: MemoryFlags,
}

impl Attributes {
    /// Creates attributes from a memory type and flags.
    pub const fn new(memory_type: MemoryType, flags: MemoryFlags) -> Self {
        Self { memory_type, flags }
    }

    /// Normal cacheable memory with the given flags.
    pub const fn normal(flags: MemoryFlags) -> Self {
        Self::new(MemoryType::Normal, flags)
    }

    /// Strongly-ordered device memory with the given flags.
    pub const fn device(flags: MemoryFlags) -> Self {
        Self::new(MemoryType::DeviceNgnrne, flags)
    }

    /// Returns a copy with `flags` added.
    pub const fn with(mut self, flags: MemoryFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }
}

bitflags! {
    /// Attribute bits of block, page and invalid descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescAttrs: u64 {
        /// AttrIndx[2:0], the MAIR_EL1 index.
        const ATTR_INDEX = 0b111 << 2;
        /// Non-secure.
        const NS = 1 << 5;
        /// AP[1]: EL0 gets the same access as EL1.
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only.
        const AP_RO = 1 << 7;
        /// SH[1:0] = outer shareable.
        const SH_OUTER = 0b10 << 8;
        /// SH[1:0] = inner shareable.
        const SH_INNER = 0b11 << 8;
        /// Access flag.
        const AF = 1 << 10;
        /// Not global.
        const NG = 1 << 11;
        /// Privileged execute-never.
        const PXN = 1 << 53;
        /// Unprivileged execute-never.
        const UXN = 1 << 54;
        /// Software-defined: the page may be made writable on a write fault.
        const SW_WRITABLE = 1 << 55;
    }
}

impl DescAttrs {
    /// Returns the MAIR_EL1 attribute index.
    pub const fn attr_index(self) -> u64 {
        (self.bits() & Self::ATTR_INDEX.bits()) >> 2
    }

    /// Returns the SH[1:0] field.
    pub const fn shareability(self) -> u64 {
        (self.bits() >> 8) & 0b11
    }

    /// Returns whether the descriptor is inner shareable.
    pub const fn is_inner_shareable(self) -> bool {
        self.shareability() == 0b11
    }

    /// Returns whether the descriptor is outer shareable.
    pub const fn is_outer_shareable(self) -> bool {
        self.shareability() == 0b10
    }
}

/// Builds the descriptor attribute bits for a region.
pub fn region_descriptor(attributes: Attributes) -> DescAttrs {
    let flags = attributes.flags;
    let writable = flags.contains(MemoryFlags::WRITE);
    let mut desc = DescAttrs::from_bits_retain(attributes.memory_type.attr_index() << 2);

    if !writable {
        desc |= DescAttrs::AP_RO;
    }
    if cfg!(feature = "demand-paging") && writable {
        desc |= DescAttrs::SW_WRITABLE;
    }
    if flags.contains(MemoryFlags::USER) {
        desc |= DescAttrs::AP_EL0;
    }
    if flags.contains(MemoryFlags::NON_SECURE) {
        desc |= DescAttrs::NS;
    }
    if flags.contains(MemoryFlags::NON_GLOBAL) {
        desc |= DescAttrs::NG;
    }

    // An absent page must fault on any access.
    if flags.contains(MemoryFlags::PAGED_OUT) {
        desc |= DescAttrs::AP_RO;
    } else {
        desc |= DescAttrs::AF;
    }

    match attributes.memory_type {
        MemoryType::DeviceNgnrne | MemoryType::DeviceNgnre | MemoryType::DeviceGre => {
            desc |= DescAttrs::SH_OUTER | DescAttrs::PXN | DescAttrs::UXN;
        }
        MemoryType::Normal | MemoryType::NormalNonCacheable | MemoryType::NormalWriteThrough => {
            if writable || flags.contains(MemoryFlags::PRIVILEGED_EXECUTE_NEVER) {
                desc |= DescAttrs::PXN;
            }
            if writable || flags.contains(MemoryFlags::USER_EXECUTE_NEVER) {
                desc |= DescAttrs::UXN;
            }
            if attributes.memory_type == MemoryType::Normal {
                desc |= DescAttrs::SH_INNER;
            } else {
                desc |= DescAttrs::SH_OUTER;
            }
        }
    }

    desc
}

/// A decoded translation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// Nothing mapped; the all-zero pattern.
    Free,
    /// Reference to a next-level table.
    Table(TableHandle),
    /// Block mapping at L1 or L2.
    Block {
        phys: PhysicalAddress,
        attrs: DescAttrs,
    },
    /// Page mapping at L3.
    Page {
        phys: PhysicalAddress,
        attrs: DescAttrs,
    },
    /// Faulting entry carrying a backing-store location.
    Invalid { location: usize, attrs: DescAttrs },
}

impl Descriptor {
    /// Decodes a raw descriptor found at `level`.
    ///
    /// `table_at` resolves the output address of a table descriptor to its handle.
    pub fn decode(
        raw: u64,
        level: Level,
        table_at: impl FnOnce(PhysicalAddress) -> TableHandle,
    ) -> Self {
        if raw == 0 {
            return Self::Free;
        }

        let address = (raw & ADDRESS_MASK) as usize;
        let attrs = DescAttrs::from_bits_retain(raw & ATTRIBUTES_MASK);
        match raw & TYPE_MASK {
            TYPE_TABLE_OR_PAGE if level.is_last() => Self::Page {
                phys: PhysicalAddress::new(address),
                attrs,
            },
            TYPE_TABLE_OR_PAGE => Self::Table(table_at(PhysicalAddress::new(address))),
            TYPE_BLOCK => Self::Block {
                phys: PhysicalAddress::new(address),
                attrs,
            },
            _ => Self::Invalid {
                location: address,
                attrs,
            },
        }
    }

    /// Encodes the descriptor for storage at `level`.
    ///
    /// `table_phys` resolves a table handle to the table's physical address.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor kind is not valid at `level` or if an address does not fit
    /// the output address field.
    pub fn encode(self, level: Level, table_phys: impl FnOnce(TableHandle) -> PhysicalAddress) -> u64 {
        match self {
            Self::Free => 0,
            Self::Table(table) => {
                assert!(!level.is_last(), "table descriptor at the last level");
                output_address(table_phys(table).as_usize()) | TYPE_TABLE_OR_PAGE
            }
            Self::Block { phys, attrs } => {
                assert!(
                    level.can_hold_block() && !level.is_last(),
                    "block descriptor at {level:?}"
                );
                output_address(phys.as_usize()) | attrs.bits() | TYPE_BLOCK
            }
            Self::Page { phys, attrs } => {
                assert!(level.is_last(), "page descriptor at {level:?}");
                output_address(phys.as_usize()) | attrs.bits() | TYPE_TABLE_OR_PAGE
            }
            // The read-only bit keeps a zero location from encoding as free.
            Self::Invalid { location, attrs } => {
                output_address(location) | (attrs | DescAttrs::AP_RO).bits() | TYPE_INVALID
            }
        }
    }

    /// Returns whether the slot is empty.
    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// Returns the attribute bits of a leaf descriptor.
    pub const fn attrs(&self) -> Option<DescAttrs> {
        match self {
            Self::Block { attrs, .. } | Self::Page { attrs, .. } | Self::Invalid { attrs, .. } => {
                Some(*attrs)
            }
            Self::Free | Self::Table(_) => None,
        }
    }

    /// Returns a copy of a leaf descriptor with its attributes replaced.
    pub(crate) fn with_attrs(self, attrs: DescAttrs) -> Self {
        match self {
            Self::Block { phys, .. } => Self::Block { phys, attrs },
            Self::Page { phys, .. } => Self::Page { phys, attrs },
            Self::Invalid { location, .. } => Self::Invalid { location, attrs },
            other => other,
        }
    }
}

fn output_address(address: usize) -> u64 {
    let address = address as u64;
    assert_eq!(
        address & !ADDRESS_MASK,
        0,
        "address {address:#x} does not fit a descriptor"
    );
    address
}

/// Template for the leaf descriptors written by a mapping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Leaf {
    /// Output address (or backing-store location) of the first byte of the range.
    pub output: usize,
    pub attrs: DescAttrs,
    pub paged_out: bool,
}

impl Leaf {
    /// Creates the template for mapping `phys` with the given attributes.
    pub fn new(phys: PhysicalAddress, attributes: Attributes) -> Self {
        Self {
            output: phys.as_usize(),
            attrs: region_descriptor(attributes),
            paged_out: attributes.flags.contains(MemoryFlags::PAGED_OUT),
        }
    }

    /// Creates a template that reproduces an existing leaf descriptor.
    pub fn from_descriptor(descriptor: Descriptor) -> Option<Self> {
        match descriptor {
            Descriptor::Block { phys, attrs } | Descriptor::Page { phys, attrs } => Some(Self {
                output: phys.as_usize(),
                attrs,
                paged_out: false,
            }),
            Descriptor::Invalid { location, attrs } => Some(Self {
                output: location,
                attrs,
                paged_out: true,
            }),
            Descriptor::Free | Descriptor::Table(_) => None,
        }
    }

    /// Returns a template advanced by `offset` bytes.
    pub const fn advance(self, offset: usize) -> Self {
        Self {
            output: self.output + offset,
            ..self
        }
    }

    /// Returns the descriptor this template produces at `level`.
    pub fn descriptor(self, level: Level) -> Descriptor {
        if self.paged_out {
            Descriptor::Invalid {
                location: self.output,
                attrs: self.attrs,
            }
        } else if level.is_last() {
            Descriptor::Page {
                phys: PhysicalAddress::new(self.output),
                attrs: self.attrs,
            }
        } else {
            Descriptor::Block {
                phys: PhysicalAddress::new(self.output),
                attrs: self.attrs,
            }
        }
    }

    /// Returns whether `existing` at `level` already maps the page at `virt` the way this
    /// template would.
    ///
    /// The existing entry may cover more than the requested range as long as it has the
    /// same attributes and the same virtual-to-output offset.
    pub fn is_covered_by(self, existing: Descriptor, level: Level, virt: usize) -> bool {
        let base = self
            .output
            .wrapping_sub(virt & (level.block_size() - 1));
        match existing {
            Descriptor::Block { phys, attrs } | Descriptor::Page { phys, attrs } => {
                !self.paged_out && attrs == self.attrs && phys.as_usize() == base
            }
            Descriptor::Invalid { location, attrs } => {
                self.paged_out
                    && level.is_last()
                    && (attrs | DescAttrs::AP_RO) == (self.attrs | DescAttrs::AP_RO)
                    && location == self.output
            }
            Descriptor::Free | Descriptor::Table(_) => false,
        }
    }
}
