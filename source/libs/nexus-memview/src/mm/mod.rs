// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process virtual-memory substrate (frames, Sv39 tables, regions, address space)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, Task, FrameTable, PageTable, PageFlags, MapError, Vma, VmaMap,
//!             RegionKind
//! INVARIANTS: Every data page referenced by a view holds one frame reference per view

mod address_space;
mod frame;
mod page_table;
mod vma;

pub(crate) use address_space::Mm;
pub use address_space::{AddressSpace, Task};
pub use frame::{FrameTable, Pfn};
pub use page_table::{entry_flags, entry_ppn, MapError, PageFlags, PageTable, PAGE_SIZE};
pub use vma::{RegionKind, Vma, VmaMap, USER_CEILING, USER_FLOOR};
