//! Error types surfaced by the translation table engine.
//!
//! Only conditions a caller can reasonably act on are errors. Broken invariants (usage
//! underflow, misaligned arguments, table addresses outside the pool) panic instead.

use core::fmt;

/// Errors that can occur while changing translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// The table pool has no free table left.
    NoMemory,
    /// The range is already mapped and overwriting was not allowed.
    AlreadyMapped,
    /// The range lies outside what the configured translation regime can express.
    Unsupported,
    /// The domain list is full.
    TooManyDomains,
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "translation table pool exhausted"),
            Self::AlreadyMapped => write!(f, "range already mapped"),
            Self::Unsupported => write!(f, "range not supported by the translation regime"),
            Self::TooManyDomains => write!(f, "too many memory domains"),
        }
    }
}

/// Reasons a software table walk can fail to produce a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// Nothing is mapped at the address.
    NotMapped,
    /// The page is paged out; the value is its backing-store location token.
    PagedOut(usize),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "address not mapped"),
            Self::PagedOut(location) => write!(f, "page paged out to {location:#x}"),
        }
    }
}
