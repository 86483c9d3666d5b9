// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the registries, membership operations and the substrate.

use core::fmt;

use crate::cap::Capability;
use crate::mm::MapError;
use crate::types::{ContextId, DomainId};

/// Result alias for memory-view operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Which slot table an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// Domain table.
    Domain,
    /// Context table.
    Context,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Domain => f.write_str("domain"),
            SlotKind::Context => f.write_str("context"),
        }
    }
}

/// Errors produced by memory-view operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Slot table is full.
    #[error("too many {0}s")]
    OutOfSlots(SlotKind),
    /// Identifier exceeds the configured slot count.
    #[error("{kind} id {id} out of range")]
    OutOfRange {
        /// Table the id was checked against.
        kind: SlotKind,
        /// Offending raw id.
        id: u64,
    },
    /// Identifier is in range but its slot is not in use.
    #[error("{kind} {id} does not exist")]
    NotFound {
        /// Table that was searched.
        kind: SlotKind,
        /// Raw id.
        id: u32,
    },
    /// The context has not joined the domain.
    #[error("{context} has not joined {domain}; join the domain first")]
    NotAMember {
        /// Domain of the pair.
        domain: DomainId,
        /// Context of the pair.
        context: ContextId,
    },
    /// Page-table or metadata allocation failed; nothing was created.
    #[error("out of memory")]
    OutOfMemory,
    /// A fault required a capability the context does not hold.
    #[error("{context} denied access to {addr:#x} in {domain}")]
    AccessDenied {
        /// Faulting address.
        addr: usize,
        /// Domain owning the region.
        domain: DomainId,
        /// Faulting context.
        context: ContextId,
    },
    /// An operation that needs a capability the caller lacks.
    #[error("{context} lacks {required:?} in {domain}")]
    MissingCapability {
        /// Domain checked.
        domain: DomainId,
        /// Caller context.
        context: ContextId,
        /// Capability that was required.
        required: Capability,
    },
    /// Operation is not permitted on the master context.
    #[error("operation not permitted on the master context")]
    MasterContext,
    /// The global domain is reclaimed only at address-space teardown.
    #[error("operation not permitted on the global domain")]
    GlobalDomain,
    /// The address space does not use the isolation model.
    #[error("isolation model is not enabled for this address space")]
    NotEnabled,
    /// The isolation model was already enabled.
    #[error("isolation model already enabled")]
    AlreadyEnabled,
    /// No region covers the address.
    #[error("no mapping covers {addr:#x}")]
    NoMapping {
        /// Address looked up.
        addr: usize,
    },
    /// Arguments were rejected before touching any state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Underlying page-table operation failed.
    #[error("page table: {0}")]
    Map(MapError),
}

impl From<MapError> for Error {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Map(other),
        }
    }
}

impl Error {
    pub(crate) fn not_found_domain(id: DomainId) -> Self {
        Self::NotFound { kind: SlotKind::Domain, id: id.raw() }
    }

    pub(crate) fn not_found_context(id: ContextId) -> Self {
        Self::NotFound { kind: SlotKind::Context, id: id.raw() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_oom_collapses_to_out_of_memory() {
        assert_eq!(Error::from(MapError::OutOfMemory), Error::OutOfMemory);
        assert_eq!(Error::from(MapError::Overlap), Error::Map(MapError::Overlap));
    }

    #[test]
    fn messages_name_the_pair() {
        let err = Error::NotAMember { domain: DomainId::new(4), context: ContextId::new(9) };
        assert_eq!(err.to_string(), "context 9 has not joined domain 4; join the domain first");
        assert_eq!(Error::OutOfSlots(SlotKind::Domain).to_string(), "too many domains");
    }
}
