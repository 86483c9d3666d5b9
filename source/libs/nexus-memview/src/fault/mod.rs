// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault mediation: classify a fault, check membership and capabilities
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: FaultCode, FaultStage, Verdict, Rejection, FaultOutcome, AccessViolation,
//!             ViolationReason, required_caps, MemView::validate
//! DEPENDS_ON: cap::Capability, view::MemView
//! INVARIANTS: Tasks without a context always pass through; rejected faults are never retried
//!
//! A fault walks `NotUsingModel -> MembershipCheck -> CapabilityCheck` and ends in
//! either `Accept` or `Reject`. Accepted faults by non-master contexts continue in
//! the lazy propagator, which copies the entry from the master view.

pub(crate) mod propagate;

use core::fmt;

use bitflags::bitflags;

use crate::cap::Capability;
use crate::error::Error;
use crate::mm::MapError;
use crate::types::{ContextId, DomainId};
use crate::view::MemView;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Classification word delivered with a page fault.
    pub struct FaultCode: u32 {
        /// The page was present; the access violated its protection.
        const PROTECTION = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
        /// A reserved bit was set in a paging entry.
        const RESERVED = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}

impl FaultCode {
    /// User-mode read.
    pub const READ_ACCESS: Self = Self::USER;
    /// User-mode write.
    pub const WRITE_ACCESS: Self = Self::USER.union(Self::WRITE);
    /// User-mode instruction fetch.
    pub const FETCH_ACCESS: Self = Self::USER.union(Self::INSTRUCTION);
}

/// Stage at which a fault decision was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultStage {
    /// The faulting task does not use the isolation model.
    NotUsingModel,
    /// The context's membership in the owning domain was checked.
    MembershipCheck,
    /// The context's capabilities in the owning domain were checked.
    CapabilityCheck,
}

/// Why a fault was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Stage that rejected the fault.
    pub stage: FaultStage,
    /// Domain owning the faulting region.
    pub domain: DomainId,
    /// Faulting context.
    pub context: ContextId,
    /// Capabilities the access needed.
    pub required: Capability,
}

/// Outcome of validating a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Not using the model; hand the fault to the ordinary handler.
    PassThrough,
    /// Access allowed with the capabilities the context holds.
    Accept {
        /// Domain owning the faulting region.
        domain: DomainId,
        /// Faulting context.
        context: ContextId,
        /// Capabilities held by the context in the domain.
        caps: Capability,
    },
    /// Access refused.
    Reject(Rejection),
}

impl Verdict {
    /// Stage the decision was taken at.
    pub fn stage(&self) -> FaultStage {
        match self {
            Verdict::PassThrough => FaultStage::NotUsingModel,
            Verdict::Accept { .. } => FaultStage::CapabilityCheck,
            Verdict::Reject(rejection) => rejection.stage,
        }
    }
}

/// Capabilities a fault with `code` requires.
///
/// Writes need WRITE, everything else needs READ. Instruction fetches also need
/// EXECUTE when `enforce_execute` is set.
pub fn required_caps(code: FaultCode, enforce_execute: bool) -> Capability {
    if code.contains(FaultCode::WRITE) {
        Capability::WRITE
    } else if code.contains(FaultCode::INSTRUCTION) && enforce_execute {
        Capability::READ | Capability::EXECUTE
    } else {
        Capability::READ
    }
}

/// Why an access was turned into a violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationReason {
    /// No region covers the address.
    NoMapping,
    /// The region's own protection forbids the access.
    RegionProtection,
    /// The context has not joined the owning domain.
    NotAMember {
        /// Owning domain.
        domain: DomainId,
        /// Faulting context.
        context: ContextId,
    },
    /// The context lacks a required capability.
    MissingCapability {
        /// Owning domain.
        domain: DomainId,
        /// Faulting context.
        context: ContextId,
        /// Capabilities the access needed.
        required: Capability,
    },
    /// The faulting context no longer exists.
    ContextGone {
        /// Context the task was assigned to.
        context: ContextId,
    },
    /// A page-table walk or update failed for a reason other than memory exhaustion.
    PageTable(MapError),
}

/// Protection violation delivered to the faulting task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessViolation {
    /// Faulting address.
    pub addr: usize,
    /// Fault classification.
    pub code: FaultCode,
    /// Why the access failed.
    pub reason: ViolationReason,
}

impl AccessViolation {
    pub(crate) fn rejected(addr: usize, code: FaultCode, rejection: Rejection) -> Self {
        let Rejection { stage, domain, context, required } = rejection;
        let reason = match stage {
            FaultStage::CapabilityCheck => {
                ViolationReason::MissingCapability { domain, context, required }
            }
            _ => ViolationReason::NotAMember { domain, context },
        };
        Self { addr, code, reason }
    }

    /// Error equivalent, for callers that surface violations as return values.
    pub fn to_error(&self) -> Error {
        match self.reason {
            ViolationReason::NoMapping | ViolationReason::RegionProtection => {
                Error::NoMapping { addr: self.addr }
            }
            ViolationReason::NotAMember { domain, context }
            | ViolationReason::MissingCapability { domain, context, .. } => {
                Error::AccessDenied { addr: self.addr, domain, context }
            }
            ViolationReason::ContextGone { context } => Error::not_found_context(context),
            ViolationReason::PageTable(err) => Error::Map(err),
        }
    }
}

impl fmt::Display for AccessViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "access violation at {:#x} ({:?}): {:?}", self.addr, self.code, self.reason)
    }
}

/// Result of handling one fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The view already held a matching entry.
    Spurious,
    /// A fresh page was allocated.
    Major,
    /// An existing page was made visible in the faulting view.
    Minor,
    /// The access was refused.
    Violation(AccessViolation),
    /// No frame was available for the page or a table level.
    OutOfMemory,
}

impl FaultOutcome {
    /// True when the access may be retried and will succeed.
    pub fn is_resolved(&self) -> bool {
        matches!(self, FaultOutcome::Spurious | FaultOutcome::Major | FaultOutcome::Minor)
    }
}

impl MemView {
    /// Decides whether `context` may perform an access classified by `code` in `domain`.
    pub fn validate(&self, context: Option<ContextId>, domain: DomainId, code: FaultCode) -> Verdict {
        let Some(context) = context else {
            return Verdict::PassThrough;
        };
        let required = required_caps(code, self.config.enforce_execute);
        let reject = |stage| Verdict::Reject(Rejection { stage, domain, context, required });
        let Ok((dom, ctx)) = self.pair(domain, context) else {
            return reject(FaultStage::MembershipCheck);
        };
        let caps = dom.caps.lock();
        if !ctx.joined.lock().test(domain.index()) {
            return reject(FaultStage::MembershipCheck);
        }
        let held = caps.get(context);
        if !held.contains(required) {
            return reject(FaultStage::CapabilityCheck);
        }
        Verdict::Accept { domain, context, caps: held }
    }
}
