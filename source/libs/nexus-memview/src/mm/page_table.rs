// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table model with lazy allocation of intermediate levels.
//!
//! Table pages live in an arena keyed by the frame number they were allocated
//! from; entries hold `(ppn << 10) | flags` exactly as the hardware format does,
//! so non-leaf entries name the next table by frame number.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use super::frame::{FrameTable, Pfn};

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Bytes covered by one entry at each level, root first.
const LEVEL_SPAN: [usize; 3] = [1 << 30, 1 << 21, PAGE_SIZE];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        /// Entry is present.
        const VALID = 1 << 0;
        /// Readable.
        const READ = 1 << 1;
        /// Writable.
        const WRITE = 1 << 2;
        /// Executable.
        const EXECUTE = 1 << 3;
        /// Reachable from user mode.
        const USER = 1 << 4;
        /// Present in every address space.
        const GLOBAL = 1 << 5;
        /// Set by hardware on access.
        const ACCESSED = 1 << 6;
        /// Set by hardware on write.
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// Virtual address was not page aligned.
    #[error("address not page aligned")]
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    #[error("address outside the canonical Sv39 range")]
    OutOfRange,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a valid leaf")]
    InvalidFlags,
    /// No frame was available for a table page.
    #[error("out of table pages")]
    OutOfMemory,
    /// A non-leaf entry names a table the arena does not know.
    #[error("dangling table entry")]
    Corrupt,
}

type Node = Box<[usize; PT_ENTRIES]>;

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: Pfn,
    nodes: HashMap<Pfn, Node>,
    frames: Arc<FrameTable>,
}

impl PageTable {
    /// Creates an empty table with a fresh root page drawn from `frames`.
    pub fn new(frames: Arc<FrameTable>) -> Result<Self, MapError> {
        let root = frames.alloc().ok_or(MapError::OutOfMemory)?;
        let mut nodes = HashMap::new();
        nodes.insert(root, Box::new([0; PT_ENTRIES]));
        Ok(Self { root, nodes, frames })
    }

    /// Returns the physical page number of the root page.
    pub fn root_ppn(&self) -> Pfn {
        self.root
    }

    /// Number of table pages currently owned, root included.
    pub fn table_pages(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up the leaf entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let table = self.leaf_table(va).ok()?;
        let entry = self.nodes.get(&table)?[vpn_indices(va)[2]];
        (entry & PageFlags::VALID.bits() != 0).then_some(entry)
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        check_va(va)?;
        check_leaf_flags(flags)?;
        let table = self.walk_alloc(va)?;
        let slot = &mut self.node_mut(table)?[vpn_indices(va)[2]];
        if *slot & PageFlags::VALID.bits() != 0 {
            return Err(MapError::Overlap);
        }
        *slot = make_entry(pa / PAGE_SIZE, flags);
        Ok(())
    }

    /// Installs or replaces the leaf at `va`; returns the previous entry.
    pub fn set_leaf(
        &mut self,
        va: usize,
        ppn: Pfn,
        flags: PageFlags,
    ) -> Result<Option<usize>, MapError> {
        check_va(va)?;
        check_leaf_flags(flags)?;
        let table = self.walk_alloc(va)?;
        let slot = &mut self.node_mut(table)?[vpn_indices(va)[2]];
        let prev = *slot;
        *slot = make_entry(ppn, flags);
        Ok((prev & PageFlags::VALID.bits() != 0).then_some(prev))
    }

    /// Removes the leaf at `va`; returns it if one was present.
    pub fn unmap(&mut self, va: usize) -> Result<Option<usize>, MapError> {
        check_va(va)?;
        let Ok(table) = self.leaf_table(va) else {
            return Ok(None);
        };
        let slot = &mut self.node_mut(table)?[vpn_indices(va)[2]];
        let prev = core::mem::take(slot);
        Ok((prev & PageFlags::VALID.bits() != 0).then_some(prev))
    }

    /// Removes every leaf in `[start, end)` and returns `(va, entry)` pairs.
    ///
    /// Absent intermediate tables are skipped a whole level span at a time.
    pub fn clear_range(&mut self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut removed = Vec::new();
        let mut va = start & !(PAGE_SIZE - 1);
        while va < end && is_canonical_sv39(va) {
            match self.leaf_table(va) {
                Ok(table) => {
                    if let Some(node) = self.nodes.get_mut(&table) {
                        let prev = core::mem::take(&mut node[vpn_indices(va)[2]]);
                        if prev & PageFlags::VALID.bits() != 0 {
                            removed.push((va, prev));
                        }
                    }
                    va += PAGE_SIZE;
                }
                Err(span) => va = (va & !(span - 1)) + span,
            }
        }
        removed
    }

    /// Frees lower-level tables that no longer hold any valid entry.
    ///
    /// The root is never freed. Returns the number of table pages released.
    pub fn prune(&mut self) -> usize {
        let mut freed = 0;
        for top in 0..PT_ENTRIES {
            let Some(mid) = self.child(self.root, top) else { continue };
            for index in 0..PT_ENTRIES {
                let Some(leaf) = self.child(mid, index) else { continue };
                if self.is_empty_node(leaf) {
                    self.free_node(leaf);
                    self.clear_entry(mid, index);
                    freed += 1;
                }
            }
            if self.is_empty_node(mid) {
                self.free_node(mid);
                self.clear_entry(self.root, top);
                freed += 1;
            }
        }
        if freed > 0 {
            log::trace!(target: "pt", "PT-PRUNE: root={} freed={freed}", self.root);
        }
        freed
    }

    /// Iterates every valid leaf as `(va, entry)` in ascending address order.
    pub fn leaves(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for top in 0..PT_ENTRIES {
            let Some(mid) = self.child(self.root, top) else { continue };
            for index in 0..PT_ENTRIES {
                let Some(leaf) = self.child(mid, index) else { continue };
                let Some(node) = self.nodes.get(&leaf) else { continue };
                for (slot, entry) in node.iter().enumerate() {
                    if entry & PageFlags::VALID.bits() != 0 {
                        let va = top * LEVEL_SPAN[0] + index * LEVEL_SPAN[1] + slot * PAGE_SIZE;
                        out.push((va, *entry));
                    }
                }
            }
        }
        out
    }

    /// Returns the leaf-level table covering `va`, or the span to skip when a level is absent.
    fn leaf_table(&self, va: usize) -> Result<Pfn, usize> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in 0..2 {
            let entry = self.nodes.get(&table).ok_or(LEVEL_SPAN[level])?[indices[level]];
            if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
                return Err(LEVEL_SPAN[level]);
            }
            table = entry_ppn(entry);
        }
        Ok(table)
    }

    fn walk_alloc(&mut self, va: usize) -> Result<Pfn, MapError> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for index in &indices[..2] {
            let entry = self.node_mut(table)?[*index];
            if entry & PageFlags::VALID.bits() != 0 {
                if entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                table = entry_ppn(entry);
                continue;
            }
            let next = self.alloc_node()?;
            self.node_mut(table)?[*index] = make_entry(next, PageFlags::VALID);
            table = next;
        }
        Ok(table)
    }

    fn alloc_node(&mut self) -> Result<Pfn, MapError> {
        let pfn = self.frames.alloc().ok_or(MapError::OutOfMemory)?;
        self.nodes.insert(pfn, Box::new([0; PT_ENTRIES]));
        Ok(pfn)
    }

    fn free_node(&mut self, pfn: Pfn) {
        if self.nodes.remove(&pfn).is_some() {
            self.frames.put(pfn);
        }
    }

    fn node_mut(&mut self, pfn: Pfn) -> Result<&mut Node, MapError> {
        self.nodes.get_mut(&pfn).ok_or(MapError::Corrupt)
    }

    fn child(&self, table: Pfn, index: usize) -> Option<Pfn> {
        let entry = self.nodes.get(&table)?[index];
        (entry & PageFlags::VALID.bits() != 0 && entry & LEAF_PERMS.bits() == 0)
            .then(|| entry_ppn(entry))
    }

    fn clear_entry(&mut self, table: Pfn, index: usize) {
        if let Some(node) = self.nodes.get_mut(&table) {
            node[index] = 0;
        }
    }

    fn is_empty_node(&self, pfn: Pfn) -> bool {
        match self.nodes.get(&pfn) {
            Some(node) => node.iter().all(|entry| entry & PageFlags::VALID.bits() == 0),
            None => true,
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for (pfn, _) in self.nodes.drain() {
            self.frames.put(pfn);
        }
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Physical page number stored in an entry.
pub fn entry_ppn(entry: usize) -> Pfn {
    entry >> 10
}

/// Flag bits stored in an entry.
pub fn entry_flags(entry: usize) -> PageFlags {
    PageFlags::from_bits_truncate(entry & 0x3ff)
}

fn make_entry(ppn: Pfn, flags: PageFlags) -> usize {
    (ppn << 10) | flags.bits()
}

fn check_va(va: usize) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    if !is_canonical_sv39(va) {
        return Err(MapError::OutOfRange);
    }
    Ok(())
}

fn check_leaf_flags(flags: PageFlags) -> Result<(), MapError> {
    if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
        return Err(MapError::InvalidFlags);
    }
    // Sv39 reserves W without R.
    if flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::READ) {
        return Err(MapError::InvalidFlags);
    }
    Ok(())
}

fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: PageFlags = PageFlags::VALID.union(PageFlags::READ).union(PageFlags::WRITE);

    fn table(frames: usize) -> (Arc<FrameTable>, PageTable) {
        let frames = Arc::new(FrameTable::new(frames));
        let table = PageTable::new(frames.clone()).unwrap();
        (frames, table)
    }

    #[test]
    fn rejects_unaligned_addresses() {
        let (_, mut table) = table(8);
        assert_eq!(table.map(1, PAGE_SIZE, RW), Err(MapError::Unaligned));
        assert_eq!(table.map(0, 1, RW), Err(MapError::Unaligned));
    }

    #[test]
    fn rejects_invalid_flags() {
        let (_, mut table) = table(8);
        assert_eq!(table.map(0, 0, PageFlags::empty()), Err(MapError::InvalidFlags));
        assert_eq!(table.map(0, 0, PageFlags::VALID), Err(MapError::InvalidFlags));
        assert_eq!(
            table.map(0, 0, PageFlags::VALID | PageFlags::WRITE),
            Err(MapError::InvalidFlags)
        );
    }

    #[test]
    fn detects_overlap() {
        let (_, mut table) = table(8);
        table.map(0, 0, RW).expect("first mapping");
        assert_eq!(table.map(0, PAGE_SIZE, RW), Err(MapError::Overlap));
    }

    #[test]
    fn out_of_range_rejected() {
        let (_, mut table) = table(8);
        assert_eq!(table.map(1usize << 50, 0, RW), Err(MapError::OutOfRange));
    }

    #[test]
    fn lookup_observes_mapping() {
        let (_, mut table) = table(8);
        table.map(0x40_0000, PAGE_SIZE, RW).expect("map");
        assert_eq!(table.lookup(0x40_0000), Some((1 << 10) | RW.bits()));
        assert_eq!(table.lookup(0x40_1000), None);
        assert_eq!(table.table_pages(), 3);
    }

    #[test]
    fn set_leaf_replaces_and_reports_previous() {
        let (_, mut table) = table(8);
        assert_eq!(table.set_leaf(0x1000, 7, RW), Ok(None));
        let ro = PageFlags::VALID | PageFlags::READ;
        let prev = table.set_leaf(0x1000, 7, ro).unwrap();
        assert_eq!(prev.map(entry_flags), Some(RW));
        assert_eq!(table.lookup(0x1000).map(entry_flags), Some(ro));
        assert_eq!(table.lookup(0x1000).map(entry_ppn), Some(7));
    }

    #[test]
    fn intermediate_allocation_failure_is_out_of_memory() {
        let (_, mut table) = table(2);
        assert_eq!(table.map(0, 0, RW), Err(MapError::OutOfMemory));
    }

    #[test]
    fn clear_range_and_prune_release_tables() {
        let (frames, mut table) = table(16);
        let free_before = frames.free_count();
        table.map(0x1000, 0x5000, RW).unwrap();
        table.map(0x4000_0000, 0x6000, RW).unwrap();
        assert_eq!(table.table_pages(), 5);
        let removed = table.clear_range(0, 0x8000_0000);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.prune(), 4);
        assert_eq!(table.table_pages(), 1);
        assert_eq!(frames.free_count(), free_before);
        assert!(table.leaves().is_empty());
    }

    #[test]
    fn drop_returns_every_table_page() {
        let frames = Arc::new(FrameTable::new(8));
        {
            let mut table = PageTable::new(frames.clone()).unwrap();
            table.map(0x2000, 0, RW).unwrap();
            assert_eq!(frames.free_count(), 5);
        }
        assert_eq!(frames.free_count(), 8);
    }
}
