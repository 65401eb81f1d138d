//! Mapping and unmapping of virtual ranges in a table tree.
//!
//! Ranges are mapped with the largest descriptors their alignment allows. Parts that
//! cannot be expressed at a level (because they are smaller than the level's span, or
//! the virtual and output addresses are not aligned to it) are handled one level down,
//! expanding the slot into a subtable first.

use core::cmp::min;

use log::trace;

use crate::descriptor::{Descriptor, Leaf, Level};
use crate::error::{MmuError, TranslateError};
use crate::pool::{ENTRIES_PER_TABLE, TableHandle, TablePool};
use crate::PhysicalAddress;

/// Whether a mapping may replace existing translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Existing translations in the range are replaced.
    Allow,
    /// Mapping over an existing translation fails with [`MmuError::AlreadyMapped`].
    Forbid,
}

/// Deepest path of table descents a single mapping step can take.
const MAX_DEPTH: usize = 4;

impl<const N: usize> TablePool<N> {
    /// Maps `size` bytes at `virt` using `leaf` as the template for the first byte.
    ///
    /// On [`MmuError::NoMemory`] the tables created for the failing chunk are released
    /// again; chunks mapped before the failure stay mapped.
    pub fn set_mapping(
        &mut self,
        root: TableHandle,
        root_level: Level,
        mut virt: usize,
        mut size: usize,
        mut leaf: Leaf,
        overwrite: Overwrite,
    ) -> Result<(), MmuError> {
        while size > 0 {
            let mut table = root;
            let mut level = root_level;
            let mut path = [(root, 0, root_level); MAX_DEPTH];
            let mut depth = 0;

            let step = loop {
                let index = level.index(virt);
                let existing = self.read(table, index, level);

                if let Descriptor::Table(child) = existing {
                    path[depth] = (table, index, level);
                    depth += 1;
                    table = child;
                    level = level.child();
                    continue;
                }

                if !existing.is_free() && overwrite == Overwrite::Forbid {
                    return Err(MmuError::AlreadyMapped);
                }

                let level_size = level.block_size();
                let offset = virt & (level_size - 1);
                if leaf.is_covered_by(existing, level, virt) {
                    break min(level_size - offset, size);
                }

                let needs_table = size < level_size
                    || offset != 0
                    || leaf.output & (level_size - 1) != 0
                    || !level.can_hold_block()
                    || (leaf.paged_out && !level.is_last());
                if needs_table {
                    match self.expand_to_table(table, index, level) {
                        Ok(child) => {
                            path[depth] = (table, index, level);
                            depth += 1;
                            table = child;
                            level = level.child();
                            continue;
                        }
                        Err(err) => {
                            self.prune(&path[..depth]);
                            return Err(err);
                        }
                    }
                }

                self.write(table, index, level, leaf.descriptor(level));
                if existing.is_free() {
                    self.add_entries(table, 1);
                }
                break level_size;
            };

            virt += step;
            size -= step;
            leaf = leaf.advance(step);
        }

        Ok(())
    }

    /// Releases empty tables at the end of `path`, deepest first.
    fn prune(&mut self, path: &[(TableHandle, usize, Level)]) {
        for &(parent, index, level) in path.iter().rev() {
            let Descriptor::Table(child) = self.read(parent, index, level) else {
                break;
            };
            if !self.is_unused(child) {
                break;
            }
            trace!("pruning empty table {}", child.index());
            self.write(parent, index, level, Descriptor::Free);
            self.add_entries(parent, -1);
            self.dec_owner(child);
        }
    }

    /// Removes the translations for `size` bytes at `virt` from `table`, which sits at
    /// `level`.
    ///
    /// Blocks only partially inside the range are split first, which can fail with
    /// [`MmuError::NoMemory`]. Subtables left without entries are released.
    pub fn del_mapping(
        &mut self,
        table: TableHandle,
        mut virt: usize,
        mut size: usize,
        level: Level,
    ) -> Result<(), MmuError> {
        let level_size = level.block_size();

        while size > 0 {
            let step = min(level_size - (virt & (level_size - 1)), size);
            let index = level.index(virt);
            let mut existing = self.read(table, index, level);

            if !existing.is_free() {
                if step != level_size && matches!(existing, Descriptor::Block { .. }) {
                    existing = Descriptor::Table(self.expand_to_table(table, index, level)?);
                }

                let clear = match existing {
                    Descriptor::Table(child) => {
                        self.del_mapping(child, virt, step, level.child())?;
                        if self.is_unused(child) {
                            self.dec_owner(child);
                            true
                        } else {
                            false
                        }
                    }
                    _ => true,
                };

                if clear {
                    self.write(table, index, level, Descriptor::Free);
                    self.add_entries(table, -1);
                }
            }

            virt += step;
            size -= step;
        }

        Ok(())
    }

    /// Replaces slot `index` of `table` (at `level`) with a reference to a new subtable.
    ///
    /// A block is split into entries one level down covering the same memory with the
    /// same attributes. A free slot becomes an empty subtable.
    ///
    /// # Panics
    ///
    /// Panics at the last level, or if the slot holds anything but a block or nothing.
    pub fn expand_to_table(
        &mut self,
        table: TableHandle,
        index: usize,
        level: Level,
    ) -> Result<TableHandle, MmuError> {
        assert!(!level.is_last(), "cannot expand a descriptor at the last level");

        let existing = self.read(table, index, level);
        assert!(
            matches!(existing, Descriptor::Free | Descriptor::Block { .. }),
            "cannot expand {existing:?} at {level:?}"
        );

        let child = self.allocate().ok_or(MmuError::NoMemory)?;
        let child_level = level.child();

        match Leaf::from_descriptor(existing) {
            Some(block) => {
                let child_size = child_level.block_size();
                for i in 0..ENTRIES_PER_TABLE {
                    let descriptor = block.advance(i * child_size).descriptor(child_level);
                    self.write(child, i, child_level, descriptor);
                }
                self.add_entries(child, ENTRIES_PER_TABLE as i32);
                trace!("split {level:?} block into table {}", child.index());
            }
            None => {
                self.add_entries(table, 1);
            }
        }

        self.write(table, index, level, Descriptor::Table(child));
        Ok(child)
    }

    /// Walks the tree from `root` to the entry that translates `virt`.
    ///
    /// Returns the first non-table descriptor found and the level it sits at.
    pub fn walk(&self, root: TableHandle, root_level: Level, virt: usize) -> (Descriptor, Level) {
        let (table, index, level) = self.walk_slot(root, root_level, virt);
        (self.read(table, index, level), level)
    }

    /// Returns the table and index of the last-level slot translating `virt`, if the tree
    /// reaches the last level there.
    pub fn leaf_slot(
        &self,
        root: TableHandle,
        root_level: Level,
        virt: usize,
    ) -> Option<(TableHandle, usize)> {
        let (table, index, level) = self.walk_slot(root, root_level, virt);
        level.is_last().then_some((table, index))
    }

    fn walk_slot(
        &self,
        root: TableHandle,
        root_level: Level,
        virt: usize,
    ) -> (TableHandle, usize, Level) {
        let mut table = root;
        let mut level = root_level;
        loop {
            let index = level.index(virt);
            match self.read(table, index, level) {
                Descriptor::Table(child) => {
                    table = child;
                    level = level.child();
                }
                _ => return (table, index, level),
            }
        }
    }

    /// Translates `virt` through the tree at `root`.
    pub fn translate(
        &self,
        root: TableHandle,
        root_level: Level,
        virt: usize,
    ) -> Result<PhysicalAddress, TranslateError> {
        match self.walk(root, root_level, virt) {
            (Descriptor::Block { phys, .. } | Descriptor::Page { phys, .. }, level) => {
                Ok(phys + (virt & (level.block_size() - 1)))
            }
            (Descriptor::Invalid { location, .. }, _) => Err(TranslateError::PagedOut(location)),
            _ => Err(TranslateError::NotMapped),
        }
    }
}
