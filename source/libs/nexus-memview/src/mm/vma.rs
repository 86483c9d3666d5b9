// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mapped regions tagged with their owning domain.

use std::collections::BTreeMap;

use super::page_table::{PageFlags, PAGE_SIZE};
use crate::types::DomainId;

/// Lowest address handed out for user mappings.
pub const USER_FLOOR: usize = 0x1_0000;
/// First address past the user half of the Sv39 range.
pub const USER_CEILING: usize = 1 << 38;

/// Backing of a region; selects the resident-page counter it is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Private anonymous memory.
    Anonymous,
    /// File-backed memory.
    File,
    /// Shared memory.
    Shared,
}

/// One mapped region `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    /// First byte, page aligned.
    pub start: usize,
    /// One past the last byte, page aligned.
    pub end: usize,
    /// Subset of READ, WRITE and EXECUTE.
    pub prot: PageFlags,
    /// Backing kind.
    pub kind: RegionKind,
    /// Owning domain.
    pub domain: DomainId,
}

impl Vma {
    /// True when `addr` falls inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Page-aligned start of the page containing `addr`.
    pub fn page_of(addr: usize) -> usize {
        addr & !(PAGE_SIZE - 1)
    }
}

/// Ordered, non-overlapping set of regions.
#[derive(Debug, Default)]
pub struct VmaMap {
    regions: BTreeMap<usize, Vma>,
}

impl VmaMap {
    /// Inserts `vma`; returns false if it overlaps an existing region.
    pub fn insert(&mut self, vma: Vma) -> bool {
        if vma.start >= vma.end {
            return false;
        }
        let clash_below = self
            .regions
            .range(..vma.end)
            .next_back()
            .is_some_and(|(_, prev)| prev.end > vma.start);
        if clash_below {
            return false;
        }
        self.regions.insert(vma.start, vma);
        true
    }

    /// Removes the region starting exactly at `start`.
    pub fn remove(&mut self, start: usize) -> Option<Vma> {
        self.regions.remove(&start)
    }

    /// Region containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&Vma> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> + '_ {
        self.regions.values()
    }

    /// Regions owned by `domain`.
    pub fn owned_by(&self, domain: DomainId) -> impl Iterator<Item = &Vma> + '_ {
        self.regions.values().filter(move |vma| vma.domain == domain)
    }

    /// Retags every region with `domain`; returns how many were claimed.
    pub fn claim_all(&mut self, domain: DomainId) -> usize {
        self.regions.values_mut().for_each(|vma| vma.domain = domain);
        self.regions.len()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// True when no region is mapped.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// First-fit placement of `len` bytes between the user floor and ceiling.
    pub fn find_free(&self, len: usize) -> Option<usize> {
        let mut cursor = USER_FLOOR;
        for vma in self.regions.values() {
            if vma.start >= cursor && vma.start - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(vma.end);
        }
        (USER_CEILING.checked_sub(cursor)? >= len).then_some(cursor)
    }
}
