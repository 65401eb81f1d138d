//! Translation regime configuration.
//!
//! Everything here is const-constructible so an engine can live in a `static` and be
//! configured at compile time by the kernel that embeds it.

use crate::descriptor::{Level, MemoryType};

/// Width of the address space identifiers the CPU is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsidBits {
    /// 8-bit ASIDs (always available).
    Eight,
    /// 16-bit ASIDs (requires ID_AA64MMFR0_EL1.ASIDBits support; sets TCR_EL1.AS).
    Sixteen,
}

impl AsidBits {
    /// Returns the largest assignable ASID.
    pub const fn max_asid(self) -> u16 {
        match self {
            Self::Eight => u8::MAX as u16,
            Self::Sixteen => u16::MAX,
        }
    }
}

/// MAIR_EL1 attribute encodings, indexed by [`MemoryType`].
const MAIR_ATTRS: [(MemoryType, u64); 6] = [
    (MemoryType::DeviceNgnrne, 0x00),
    (MemoryType::DeviceNgnre, 0x04),
    (MemoryType::DeviceGre, 0x0C),
    (MemoryType::NormalNonCacheable, 0x44),
    (MemoryType::Normal, 0xFF),
    (MemoryType::NormalWriteThrough, 0xBB),
];

/// MAIR_EL1 value matching the attribute indices written into descriptors.
pub const MAIR_VALUE: u64 = {
    let mut value = 0;
    let mut i = 0;
    while i < MAIR_ATTRS.len() {
        let (memory_type, encoding) = MAIR_ATTRS[i];
        value |= encoding << (memory_type.attr_index() * 8);
        i += 1;
    }
    value
};

// TCR_EL1 fields.
const TCR_IRGN0_WBWA: u64 = 0b01 << 8;
const TCR_ORGN0_WBWA: u64 = 0b01 << 10;
const TCR_SH0_INNER: u64 = 0b11 << 12;
const TCR_TG0_4K: u64 = 0b00 << 14;
const TCR_EPD1: u64 = 1 << 23;
const TCR_IPS_SHIFT: u64 = 32;
const TCR_AS: u64 = 1 << 36;

/// Static configuration of the stage-1 translation regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuConfig {
    /// Virtual address bits translated through TTBR0 (25-48).
    pub va_bits: u8,
    /// Physical address bits (one of 32, 36, 40, 42, 44, 48).
    pub pa_bits: u8,
    /// ASID width.
    pub asid_bits: AsidBits,
    /// Start of the virtual RAM window eligible for demand paging.
    pub virt_ram_start: usize,
    /// End (exclusive) of the virtual RAM window eligible for demand paging.
    pub virt_ram_end: usize,
}

impl MmuConfig {
    /// Creates a configuration with 8-bit ASIDs and no demand-paging window.
    pub const fn new(va_bits: u8, pa_bits: u8) -> Self {
        Self {
            va_bits,
            pa_bits,
            asid_bits: AsidBits::Eight,
            virt_ram_start: 0,
            virt_ram_end: 0,
        }
    }

    /// Returns a copy using the given ASID width.
    pub const fn with_asid_bits(mut self, asid_bits: AsidBits) -> Self {
        self.asid_bits = asid_bits;
        self
    }

    /// Returns a copy with the given demand-paging window.
    pub const fn with_virt_ram(mut self, start: usize, end: usize) -> Self {
        self.virt_ram_start = start;
        self.virt_ram_end = end;
        self
    }

    /// Checks the configuration for values the hardware cannot express.
    ///
    /// # Panics
    ///
    /// Panics on an unsupported address width or an inverted RAM window.
    pub const fn validate(&self) {
        assert!(
            self.va_bits >= 25 && self.va_bits <= 48,
            "virtual address width must be 25-48 bits"
        );
        assert!(
            matches!(self.pa_bits, 32 | 36 | 40 | 42 | 44 | 48),
            "unsupported physical address width"
        );
        assert!(
            self.virt_ram_start <= self.virt_ram_end,
            "virtual RAM window is inverted"
        );
    }

    /// Returns the level of the top-most table for this address width.
    pub const fn base_level(&self) -> Level {
        if self.va_bits > 39 {
            Level::L0
        } else if self.va_bits > 30 {
            Level::L1
        } else {
            Level::L2
        }
    }

    /// Returns the first virtual address beyond the TTBR0 range.
    pub const fn va_limit(&self) -> usize {
        1 << self.va_bits
    }

    /// Returns the first physical address beyond the output range.
    pub const fn pa_limit(&self) -> usize {
        1 << self.pa_bits
    }

    /// Returns whether `virt` lies in the demand-paging window.
    pub const fn in_virt_ram(&self, virt: usize) -> bool {
        virt >= self.virt_ram_start && virt < self.virt_ram_end
    }

    /// Computes the TCR_EL1 value for this configuration.
    ///
    /// TTBR0 walks use 4 KiB granules with inner-shareable write-back tables; TTBR1 walks
    /// are disabled because the engine manages a single (lower) half.
    pub const fn tcr(&self) -> u64 {
        let t0sz = (64 - self.va_bits) as u64;
        let ips: u64 = match self.pa_bits {
            32 => 0b000,
            36 => 0b001,
            40 => 0b010,
            42 => 0b011,
            44 => 0b100,
            _ => 0b101,
        };
        let asid = match self.asid_bits {
            AsidBits::Eight => 0,
            AsidBits::Sixteen => TCR_AS,
        };

        t0sz | TCR_IRGN0_WBWA
            | TCR_ORGN0_WBWA
            | TCR_SH0_INNER
            | TCR_TG0_4K
            | TCR_EPD1
            | (ips << TCR_IPS_SHIFT)
            | asid
    }
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self::new(48, 48)
    }
}
