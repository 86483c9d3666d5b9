// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-domain capability bitmaps indexed by context id
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Capability, CapabilityTable
//! DEPENDS_ON: bitmap::SlotBitmap
//! INVARIANTS: One bitmap per capability category; a context holds a capability in a domain
//!             iff its bit is set in the matching bitmap

use bitflags::bitflags;

use crate::bitmap::SlotBitmap;
use crate::types::ContextId;

#[cfg(test)]
mod tests_prop;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    /// Rights a context may hold within a domain.
    pub struct Capability: u32 {
        /// Read the domain's pages.
        const READ = 1 << 0;
        /// Write the domain's pages.
        const WRITE = 1 << 1;
        /// Fetch instructions from the domain's pages.
        const EXECUTE = 1 << 2;
        /// Create mappings owned by the domain.
        const ALLOCATE = 1 << 3;
    }
}

/// Capability bitmaps owned by one domain.
#[derive(Clone, Debug)]
pub struct CapabilityTable {
    read: SlotBitmap,
    write: SlotBitmap,
    execute: SlotBitmap,
    allocate: SlotBitmap,
}

impl CapabilityTable {
    /// Creates a table with every bit cleared for `contexts` context slots.
    pub fn new(contexts: usize) -> Self {
        Self {
            read: SlotBitmap::new(contexts),
            write: SlotBitmap::new(contexts),
            execute: SlotBitmap::new(contexts),
            allocate: SlotBitmap::new(contexts),
        }
    }

    fn maps(&self) -> [(Capability, &SlotBitmap); 4] {
        [
            (Capability::READ, &self.read),
            (Capability::WRITE, &self.write),
            (Capability::EXECUTE, &self.execute),
            (Capability::ALLOCATE, &self.allocate),
        ]
    }

    fn maps_mut(&mut self) -> [(Capability, &mut SlotBitmap); 4] {
        [
            (Capability::READ, &mut self.read),
            (Capability::WRITE, &mut self.write),
            (Capability::EXECUTE, &mut self.execute),
            (Capability::ALLOCATE, &mut self.allocate),
        ]
    }

    /// Sets every bit in `caps` for `context`.
    pub fn grant(&mut self, context: ContextId, caps: Capability) {
        for (cap, map) in self.maps_mut() {
            if caps.contains(cap) {
                map.set(context.index());
            }
        }
    }

    /// Clears every bit in `caps` for `context`.
    pub fn revoke(&mut self, context: ContextId, caps: Capability) {
        for (cap, map) in self.maps_mut() {
            if caps.contains(cap) {
                map.clear(context.index());
            }
        }
    }

    /// ORs together the bits held by `context`.
    pub fn get(&self, context: ContextId) -> Capability {
        self.maps()
            .into_iter()
            .filter(|(_, map)| map.test(context.index()))
            .fold(Capability::empty(), |acc, (cap, _)| acc | cap)
    }

    /// Clears all four bits for `context`.
    pub fn clear(&mut self, context: ContextId) {
        self.revoke(context, Capability::all());
    }

    /// True when `context` holds any bit.
    pub fn holds_any(&self, context: ContextId) -> bool {
        !self.get(context).is_empty()
    }

    /// Lowest context id holding any bit.
    pub fn first_holder(&self) -> Option<ContextId> {
        self.maps()
            .into_iter()
            .filter_map(|(_, map)| map.first_set())
            .min()
            .map(ContextId::from_index)
    }

    /// Every context holding at least one bit, ascending.
    pub fn holders(&self) -> Vec<ContextId> {
        let mut union = self.read.clone();
        for map in [&self.write, &self.execute, &self.allocate] {
            for index in map.iter() {
                union.set(index);
            }
        }
        union.iter().map(ContextId::from_index).collect()
    }
}
