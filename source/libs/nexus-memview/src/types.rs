// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for domain and context identifiers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: DomainId, ContextId, GLOBAL_DOMAIN, MASTER_CONTEXT, DEFAULT_SLOTS, MAX_SLOT_LIMIT
//! INVARIANTS: Identity is the slot index; slot 0 is reserved for the master context and
//!             conventionally holds the global domain

use core::fmt;

use static_assertions::const_assert;

/// Default number of domain and context slots per address space.
pub const DEFAULT_SLOTS: usize = 1024;
/// Upper bound accepted for a configured slot count.
pub const MAX_SLOT_LIMIT: usize = 1 << 16;

const_assert!(DEFAULT_SLOTS <= MAX_SLOT_LIMIT);
const_assert!(MAX_SLOT_LIMIT <= u32::MAX as usize);

/// Identifier of a memory domain (slot index in the domain table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(u32);

/// Identifier of an execution context (slot index in the context table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

/// Domain that owns every region existing before isolation was enabled.
pub const GLOBAL_DOMAIN: DomainId = DomainId(0);
/// Context of the thread that enabled isolation; aliases the original page-table root.
pub const MASTER_CONTEXT: ContextId = ContextId(0);

impl DomainId {
    /// Wraps a raw slot index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw slot index.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns true for the global domain.
    pub const fn is_global(self) -> bool {
        self.0 == GLOBAL_DOMAIN.0
    }
}

impl ContextId {
    /// Wraps a raw slot index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw slot index.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns true for the master context.
    pub const fn is_master(self) -> bool {
        self.0 == MASTER_CONTEXT.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain {}", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids() {
        assert!(GLOBAL_DOMAIN.is_global());
        assert!(MASTER_CONTEXT.is_master());
        assert!(!ContextId::new(3).is_master());
        assert_eq!(DomainId::new(7).to_string(), "domain 7");
        assert_eq!(ContextId::new(2).to_string(), "context 2");
    }
}
