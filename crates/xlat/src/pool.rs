//! Fixed-capacity pool of translation tables.
//!
//! Tables are handed out by index and sit back to back, one page each. Next to the tables
//! the pool keeps one usage word per table, which packs two counters: the number of
//! parent descriptors (or address-space roots) referencing the table, and the number of
//! its own entries that are not free. A table whose usage word is zero is free and may be
//! handed out again.

use log::trace;

use crate::arch::{self, PAGE_SIZE};
use crate::descriptor::{Descriptor, Level};
use crate::PhysicalAddress;

/// Number of descriptors in one translation table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One owner reference in the usage word.
const OWNER_UNIT: i32 = 1 << 16;

/// Mask of the occupied-entry count in the usage word.
const OCCUPIED_MASK: u32 = 0xFFFF;

/// Packed usage word of a table: `(owners << 16) | occupied`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Usage(u32);

impl Usage {
    /// Usage of a free table.
    pub const FREE: Self = Self(0);

    /// Usage of a freshly allocated table: one owner, no entries.
    const ALLOCATED: Self = Self(OWNER_UNIT as u32);

    /// Returns the number of references to the table.
    pub const fn owners(self) -> u32 {
        self.0 >> 16
    }

    /// Returns the number of non-free slots in the table.
    pub const fn occupied(self) -> u32 {
        self.0 & OCCUPIED_MASK
    }

    /// Returns the raw usage word.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether the table is free.
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for Usage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Usage")
            .field("owners", &self.owners())
            .field("occupied", &self.occupied())
            .finish()
    }
}

/// Handle to a table in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableHandle(u16);

impl TableHandle {
    /// Handle of the kernel root table, reserved when the pool is created.
    pub(crate) const KERNEL_ROOT: Self = Self(0);

    pub(crate) const fn from_index(index: usize) -> Self {
        assert!(index <= u16::MAX as usize, "table index out of range");
        Self(index as u16)
    }

    /// Returns the index of the table in the pool.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Aggregate usage of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of tables.
    pub capacity: usize,
    /// Tables currently allocated.
    pub used_tables: usize,
    /// Tables available for allocation.
    pub free_tables: usize,
    /// Sum of the owner counts of all tables.
    pub owner_refs: usize,
    /// Sum of the occupied-entry counts of all tables.
    pub occupied_entries: usize,
}

#[repr(C, align(4096))]
struct Table([u64; ENTRIES_PER_TABLE]);

const _: () = assert!(size_of::<Table>() == PAGE_SIZE);

/// The table pool.
///
/// The pool has to stay at a fixed address once tables have been linked, because
/// descriptors reference tables by physical address. Usage words are kept apart from
/// the tables so that the tables stay contiguous.
pub(crate) struct TablePool<const N: usize> {
    tables: [Table; N],
    usage: [Usage; N],
}

impl<const N: usize> TablePool<N> {
    /// Creates a pool whose first table is reserved as the kernel root.
    pub const fn new() -> Self {
        assert!(N > 0, "table pool needs room for the kernel root");
        assert!(N <= u16::MAX as usize, "table pool too large");

        let mut usage = [Usage::FREE; N];
        usage[TableHandle::KERNEL_ROOT.index()] = Usage::ALLOCATED;
        Self {
            tables: [const { Table([0; ENTRIES_PER_TABLE]) }; N],
            usage,
        }
    }

    /// Allocates a zeroed table owned once and with no entries.
    ///
    /// Returns `None` if every table is in use.
    pub fn allocate(&mut self) -> Option<TableHandle> {
        let index = self.usage.iter().position(|usage| usage.is_free())?;
        self.tables[index].0.fill(0);
        self.usage[index] = Usage::ALLOCATED;

        let table = TableHandle::from_index(index);
        trace!("allocated table {} at {}", index, self.phys(table));
        Some(table)
    }

    /// Applies `delta` to the usage word of `table` and returns the new usage.
    ///
    /// `delta` is a whole number of owner units plus an entry count; each counter is
    /// checked on its own so that one never borrows from the other.
    ///
    /// # Panics
    ///
    /// Panics if either counter would become negative, if a table with entries would have
    /// no owner, or if more entries than a table holds would be counted.
    pub fn adjust_usage(&mut self, table: TableHandle, delta: i32) -> Usage {
        let current = self.usage(table);
        let owners = current.owners() as i32 + delta / OWNER_UNIT;
        let occupied = current.occupied() as i32 + delta % OWNER_UNIT;
        assert!(
            owners >= 0 && occupied >= 0,
            "table {} usage underflow ({current:?} {delta:+})",
            table.index()
        );
        assert!(
            occupied as usize <= ENTRIES_PER_TABLE,
            "table {} occupancy overflow ({current:?} {delta:+})",
            table.index()
        );
        assert!(
            owners <= u16::MAX as i32,
            "table {} owner overflow ({current:?} {delta:+})",
            table.index()
        );

        let updated = Usage(((owners as u32) << 16) | occupied as u32);
        assert!(
            updated.is_free() || updated.owners() > 0,
            "table {} has entries but no owner ({updated:?})",
            table.index()
        );

        self.usage[table.index()] = updated;
        if updated.is_free() {
            trace!("freed table {}", table.index());
        }
        updated
    }

    /// Adds an owner reference to `table`.
    pub fn inc_owner(&mut self, table: TableHandle) -> Usage {
        self.adjust_usage(table, OWNER_UNIT)
    }

    /// Drops an owner reference from `table`, freeing it when nothing is left.
    pub fn dec_owner(&mut self, table: TableHandle) -> Usage {
        self.adjust_usage(table, -OWNER_UNIT)
    }

    /// Adjusts the occupied-entry count of `table`.
    pub fn add_entries(&mut self, table: TableHandle, delta: i32) -> Usage {
        self.adjust_usage(table, delta)
    }

    /// Returns the usage word of `table`.
    pub fn usage(&self, table: TableHandle) -> Usage {
        self.usage[self.checked_index(table)]
    }

    /// Returns whether `table` has no occupied entries.
    pub fn is_unused(&self, table: TableHandle) -> bool {
        self.usage(table).occupied() == 0
    }

    /// Returns whether at most one parent references `table`.
    pub fn is_exclusive(&self, table: TableHandle) -> bool {
        self.usage(table).owners() < 2
    }

    /// Returns the physical address of `table`.
    pub fn phys(&self, table: TableHandle) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_base() + self.checked_index(table) * PAGE_SIZE)
    }

    /// Returns the table located at `phys`.
    ///
    /// # Panics
    ///
    /// Panics if `phys` is not the address of a table in this pool.
    pub fn handle_at(&self, phys: PhysicalAddress) -> TableHandle {
        let offset = phys.as_usize().wrapping_sub(self.phys_base());
        assert!(
            offset % PAGE_SIZE == 0 && offset / PAGE_SIZE < N,
            "table address {phys} outside the pool"
        );
        TableHandle::from_index(offset / PAGE_SIZE)
    }

    /// Reads the descriptor in slot `index` of `table`, which sits at `level`.
    pub fn read(&self, table: TableHandle, index: usize, level: Level) -> Descriptor {
        let raw = self.raw(table, index);
        Descriptor::decode(raw, level, |phys| self.handle_at(phys))
    }

    /// Writes `descriptor` into slot `index` of `table`, which sits at `level`.
    ///
    /// Occupancy is not adjusted; callers account for the slots they fill and clear.
    pub fn write(&mut self, table: TableHandle, index: usize, level: Level, descriptor: Descriptor) {
        let raw = descriptor.encode(level, |child| self.phys(child));
        let slot = self.checked_index(table);
        self.tables[slot].0[index] = raw;
        trace!("table {slot}[{index}] <- {raw:#018x}");
    }

    /// Returns the raw bits in slot `index` of `table`.
    pub fn raw(&self, table: TableHandle, index: usize) -> u64 {
        self.tables[self.checked_index(table)].0[index]
    }

    /// Returns aggregate usage figures.
    pub fn stats(&self) -> PoolStats {
        let used = || self.usage.iter().filter(|usage| !usage.is_free());
        let used_tables = used().count();
        PoolStats {
            capacity: N,
            used_tables,
            free_tables: N - used_tables,
            owner_refs: used().map(|usage| usage.owners() as usize).sum(),
            occupied_entries: used().map(|usage| usage.occupied() as usize).sum(),
        }
    }

    /// Returns the first allocated table whose occupied count disagrees with its
    /// non-free slots.
    pub fn audit(&self) -> Option<TableHandle> {
        self.tables
            .iter()
            .zip(&self.usage)
            .position(|(table, usage)| {
                let present = table.0.iter().filter(|&&raw| raw != 0).count();
                !usage.is_free() && present != usage.occupied() as usize
            })
            .map(TableHandle::from_index)
    }

    fn phys_base(&self) -> usize {
        arch::pool_phys_base(self.tables.as_ptr().cast())
    }

    fn checked_index(&self, table: TableHandle) -> usize {
        assert!(table.index() < N, "table {} outside the pool", table.index());
        table.index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulated::EMULATED_POOL_BASE;
    use crate::descriptor::DescAttrs;

    #[test]
    fn kernel_root_is_reserved() {
        let pool = TablePool::<4>::new();
        let usage = pool.usage(TableHandle::KERNEL_ROOT);
        assert_eq!(usage.owners(), 1);
        assert_eq!(usage.occupied(), 0);
        assert_eq!(pool.stats().used_tables, 1);
    }

    #[test]
    fn allocate_until_exhausted() {
        let mut pool = TablePool::<4>::new();
        let tables: [_; 3] = core::array::from_fn(|_| pool.allocate().unwrap());
        assert_eq!(tables.map(TableHandle::index), [1, 2, 3]);
        assert_eq!(pool.allocate(), None);

        pool.dec_owner(tables[1]);
        assert_eq!(pool.allocate(), Some(tables[1]));
    }

    #[test]
    fn allocation_zeroes_table() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.write(
            table,
            7,
            Level::L3,
            Descriptor::Invalid {
                location: 0x5000,
                attrs: DescAttrs::empty(),
            },
        );
        pool.dec_owner(table);

        let table = pool.allocate().unwrap();
        assert_eq!(pool.raw(table, 7), 0);
    }

    #[test]
    fn usage_packing() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.inc_owner(table);
        let usage = pool.add_entries(table, 3);
        assert_eq!(usage.bits(), (2 << 16) | 3);
        assert!(!pool.is_exclusive(table));
        assert!(!pool.is_unused(table));
    }

    #[test]
    #[should_panic(expected = "usage underflow")]
    fn underflow_is_fatal() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.add_entries(table, -1);
    }

    #[test]
    #[should_panic(expected = "usage underflow")]
    fn owner_underflow_is_fatal() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.dec_owner(table);
        pool.dec_owner(table);
    }

    #[test]
    fn entry_count_never_borrows_from_owners() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.inc_owner(table);
        pool.add_entries(table, 2);
        let usage = pool.add_entries(table, -2);
        assert_eq!((usage.owners(), usage.occupied()), (2, 0));
    }

    #[test]
    #[should_panic(expected = "has entries but no owner")]
    fn ownerless_entries_are_fatal() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.add_entries(table, 1);
        pool.dec_owner(table);
    }

    #[test]
    #[should_panic(expected = "occupancy overflow")]
    fn overfull_table_is_fatal() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        pool.add_entries(table, ENTRIES_PER_TABLE as i32 + 1);
    }

    #[test]
    fn physical_addresses() {
        let pool = TablePool::<4>::new();
        let table = TableHandle::from_index(2);
        assert_eq!(pool.phys(table).as_usize(), EMULATED_POOL_BASE + 2 * PAGE_SIZE);
        assert_eq!(pool.handle_at(pool.phys(table)), table);
    }

    #[test]
    fn tables_are_contiguous_pages() {
        let mut pool = TablePool::<4>::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_eq!(pool.phys(first).as_usize(), EMULATED_POOL_BASE + PAGE_SIZE);
        assert_eq!(pool.phys(second).as_usize() - pool.phys(first).as_usize(), PAGE_SIZE);
        assert!(size_of::<TablePool<4>>() < 5 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "outside the pool")]
    fn foreign_table_address_is_fatal() {
        let pool = TablePool::<4>::new();
        pool.handle_at(PhysicalAddress::new(EMULATED_POOL_BASE + 4 * PAGE_SIZE));
    }

    #[test]
    fn audit_finds_unaccounted_entries() {
        let mut pool = TablePool::<2>::new();
        let table = pool.allocate().unwrap();
        assert_eq!(pool.audit(), None);

        pool.write(
            table,
            0,
            Level::L3,
            Descriptor::Page {
                phys: PhysicalAddress::new(0x1000),
                attrs: DescAttrs::AF,
            },
        );
        assert_eq!(pool.audit(), Some(table));

        pool.add_entries(table, 1);
        assert_eq!(pool.audit(), None);
    }

    #[test]
    fn stats() {
        let mut pool = TablePool::<4>::new();
        let table = pool.allocate().unwrap();
        pool.add_entries(table, 5);
        pool.inc_owner(table);
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 4,
                used_tables: 2,
                free_tables: 2,
                owner_refs: 3,
                occupied_entries: 5,
            }
        );
    }
}
