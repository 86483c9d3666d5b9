// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Intra-process memory views (domains, contexts, per-context page tables)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests (scenarios, faults, stress, props)
//! PUBLIC API: AddressSpace, MemView, Task, Capability, FaultCode, FaultOutcome, Config, command
//! DEPENDS_ON: bitflags, log, parking_lot, serde/toml (config), thiserror
//! INVARIANTS: capability bit set => membership bit set; one page-table root per live context
//!
//! A single address space is split into **domains** (memory regions with their own
//! capability sets) and populated by **contexts** (isolation units that one or more
//! threads run in). Each context owns a private page-table root that starts empty and is
//! filled lazily: the first access to a page faults, the fault is validated against the
//! context's capabilities in the domain owning the region, and on success the entry is
//! copied from the master context's canonical root.
//!
//! ## Lock order
//!
//! Every path acquires locks in this order and releases them before going back up:
//!
//! 1. region lock (`Mm::regions`)
//! 2. metadata mutex (slot tables, standby context)
//! 3. domain mutex (capability bitmaps)
//! 4. context mutex (joined-domain bitmap)
//! 5. source page-table lock, then destination page-table lock
//!
//! Domain mutexes are never taken while a context mutex is held.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod bitmap;
pub mod cap;
pub mod command;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod fault;
pub mod membership;
pub mod mm;
pub mod types;
pub mod view;

mod slot;

pub use cap::{Capability, CapabilityTable};
pub use config::{Config, ConfigError};
pub use error::{Error, Result, SlotKind};
pub use fault::{AccessViolation, FaultCode, FaultOutcome, FaultStage, Verdict, ViolationReason};
pub use mm::{AddressSpace, PageFlags, RegionKind, Task, PAGE_SIZE};
pub use types::{ContextId, DomainId, GLOBAL_DOMAIN, MASTER_CONTEXT};
pub use view::MemView;
