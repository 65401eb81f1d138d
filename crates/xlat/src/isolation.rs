//! Sharing and unsharing of table subtrees between address spaces.
//!
//! A new address space starts as a shallow copy of the kernel's root table: every
//! subtable is shared and reference counted. Before a range may differ between the two,
//! the tables covering it are privatized (copied along the path). Globalizing merges the
//! range back, adopting the kernel's entries and releasing the private copies.

use core::cmp::min;

use log::trace;

use crate::descriptor::{DescAttrs, Descriptor, Leaf, Level};
use crate::error::MmuError;
use crate::mapping::Overwrite;
use crate::pool::{ENTRIES_PER_TABLE, TableHandle, TablePool};

impl<const N: usize> TablePool<N> {
    /// Returns a new table with the same entries as `src`, which sits at `level`.
    ///
    /// Subtables become shared with the copy. Leaf entries of `src` are made non-global
    /// first, since the same translation now exists in more than one address space.
    pub fn dup_table(&mut self, src: TableHandle, level: Level) -> Result<TableHandle, MmuError> {
        let dst = self.allocate().ok_or(MmuError::NoMemory)?;
        let mut copied = 0;

        for index in 0..ENTRIES_PER_TABLE {
            let mut descriptor = self.read(src, index, level);
            match descriptor {
                Descriptor::Free => continue,
                Descriptor::Table(child) => {
                    self.inc_owner(child);
                }
                _ => {
                    if let Some(attrs) = descriptor.attrs().filter(|a| !a.contains(DescAttrs::NG)) {
                        descriptor = descriptor.with_attrs(attrs | DescAttrs::NG);
                        self.write(src, index, level, descriptor);
                    }
                }
            }
            self.write(dst, index, level, descriptor);
            copied += 1;
        }

        self.add_entries(dst, copied);
        trace!("duplicated table {} into {}", src.index(), dst.index());
        Ok(dst)
    }

    /// Gives `dst` private copies of every table it shares with `src` on the paths
    /// translating `size` bytes at `virt`.
    pub fn privatize(
        &mut self,
        dst: TableHandle,
        src: TableHandle,
        mut virt: usize,
        mut size: usize,
        level: Level,
    ) -> Result<(), MmuError> {
        let level_size = level.block_size();

        while size > 0 {
            let step = min(level_size - (virt & (level_size - 1)), size);
            let index = level.index(virt);

            let slots = (self.read(dst, index, level), self.read(src, index, level));
            if let (Descriptor::Table(mut dst_child), Descriptor::Table(src_child)) = slots {
                let child_level = level.child();
                if dst_child == src_child {
                    dst_child = self.dup_table(src_child, child_level)?;
                    self.write(dst, index, level, Descriptor::Table(dst_child));
                    self.dec_owner(src_child);
                    trace!(
                        "privatized table {} as {} at {:#x}",
                        src_child.index(),
                        dst_child.index(),
                        virt
                    );
                }
                if !child_level.is_last() {
                    self.privatize(dst_child, src_child, virt, step, child_level)?;
                }
            }

            virt += step;
            size -= step;
        }

        Ok(())
    }

    /// Makes `dst` translate `size` bytes at `virt` exactly like `src` again.
    ///
    /// Entries are adopted from `src` where whole entries are covered; private subtables
    /// of `dst` they replace are released.
    pub fn globalize(
        &mut self,
        dst: TableHandle,
        src: TableHandle,
        mut virt: usize,
        mut size: usize,
        level: Level,
    ) -> Result<(), MmuError> {
        let level_size = level.block_size();

        while size > 0 {
            let offset = virt & (level_size - 1);
            let step = min(level_size - offset, size);
            let index = level.index(virt);

            if self.raw(dst, index) != self.raw(src, index) {
                self.globalize_entry(dst, src, index, virt, step, level)?;
            }

            virt += step;
            size -= step;
        }

        Ok(())
    }

    fn globalize_entry(
        &mut self,
        dst: TableHandle,
        src: TableHandle,
        index: usize,
        virt: usize,
        step: usize,
        level: Level,
    ) -> Result<(), MmuError> {
        let level_size = level.block_size();
        let existing = self.read(dst, index, level);
        let source = self.read(src, index, level);

        // Nothing in the source: just unmap the part of the private tree.
        if source.is_free() {
            match existing {
                Descriptor::Table(child) => {
                    self.del_mapping(child, virt, step, level.child())?;
                    if self.is_unused(child) {
                        self.write(dst, index, level, Descriptor::Free);
                        self.add_entries(dst, -1);
                        self.dec_owner(child);
                    }
                    return Ok(());
                }
                _ if step != level_size => {
                    let child = self.expand_to_table(dst, index, level)?;
                    return self.del_mapping(child, virt, step, level.child());
                }
                _ => {}
            }
        }

        if step != level_size {
            let dst_child = match existing {
                Descriptor::Table(child) => child,
                _ => self.expand_to_table(dst, index, level)?,
            };
            return match source {
                Descriptor::Table(src_child) => {
                    self.globalize(dst_child, src_child, virt, step, level.child())
                }
                _ => match Leaf::from_descriptor(source) {
                    Some(block) => self.set_mapping(
                        dst_child,
                        level.child(),
                        virt,
                        step,
                        block.advance(virt & (level_size - 1)),
                        Overwrite::Allow,
                    ),
                    None => Ok(()),
                },
            };
        }

        if existing.is_free() {
            self.add_entries(dst, 1);
        }
        if source.is_free() {
            self.add_entries(dst, -1);
        }
        if let Descriptor::Table(child) = source {
            self.inc_owner(child);
        }
        self.write(dst, index, level, source);

        if let Descriptor::Table(old) = existing {
            if self.is_exclusive(old) {
                self.discard(old, level.child());
            }
            self.dec_owner(old);
        }

        Ok(())
    }

    /// Clears every entry of `table`, which sits at `level`, releasing subtables that are
    /// referenced only from here.
    pub fn discard(&mut self, table: TableHandle, level: Level) {
        let mut freed = 0;

        for index in 0..ENTRIES_PER_TABLE {
            let descriptor = self.read(table, index, level);
            if let Descriptor::Table(child) = descriptor {
                if self.is_exclusive(child) {
                    self.discard(child, level.child());
                }
                self.dec_owner(child);
            }
            if !descriptor.is_free() {
                self.write(table, index, level, Descriptor::Free);
                freed += 1;
            }
        }

        self.add_entries(table, -freed);
    }
}
