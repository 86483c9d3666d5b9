// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lazy page-table-entry propagation from a source view into a faulting view.
//!
//! Lock order: metadata (only to resolve the source root), then the source
//! table, then the destination table. Both table locks are released in reverse
//! order before returning.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cap::Capability;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::mm::{entry_flags, entry_ppn, PageFlags, Vma};
use crate::types::ContextId;
use crate::view::MemView;

/// One propagation request, built by the fault path after an accepted verdict.
pub(crate) struct Propagation<'a> {
    pub(crate) dst: &'a Arc<Context>,
    pub(crate) src: ContextId,
    pub(crate) caller: ContextId,
    pub(crate) addr: usize,
    pub(crate) vma: &'a Vma,
    pub(crate) caps: Capability,
    /// Destination epoch observed before the fault was validated.
    pub(crate) epoch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Propagated {
    /// Entry copied from a page the source already mapped.
    Copied,
    /// The source had no entry; a fresh page was mapped there first.
    Populated,
    /// Destination already held the same page with the same bits.
    Unchanged,
    /// The destination view was revoked or freed after validation.
    Stale,
}

/// Leaf flags a view receives: the region protection narrowed by the capabilities held.
pub(crate) fn view_flags(prot: PageFlags, caps: Capability, enforce_execute: bool) -> PageFlags {
    let mut allowed = PageFlags::empty();
    if caps.intersects(Capability::READ | Capability::WRITE) {
        allowed |= PageFlags::READ;
    }
    if caps.contains(Capability::WRITE) {
        allowed |= PageFlags::WRITE;
    }
    let exec = if enforce_execute {
        caps.contains(Capability::EXECUTE)
    } else {
        caps.contains(Capability::READ)
    };
    if exec {
        allowed |= PageFlags::EXECUTE;
    }
    PageFlags::VALID | PageFlags::USER | (prot & allowed)
}

pub(crate) fn propagate(view: &MemView, req: Propagation<'_>) -> Result<Propagated> {
    if req.dst.id.is_master() || req.caller.is_master() {
        return Err(Error::MasterContext);
    }
    if req.src == req.dst.id {
        return Err(Error::InvalidArgument("source and destination views are the same"));
    }
    let src = view.live_context(req.src)?;
    let page = Vma::page_of(req.addr);
    let mm = &view.mm;

    let mut src_table = src.root.lock();
    let (ppn, fresh) = match src_table.lookup(page) {
        Some(entry) => (entry_ppn(entry), false),
        None if src.id.is_master() => mm.populate_locked(&mut *src_table, page, req.vma)?,
        None => return Err(Error::NoMapping { addr: req.addr }),
    };
    let flags = view_flags(req.vma.prot, req.caps, view.config.enforce_execute);

    let mut dst_table = req.dst.root.lock();
    if req.dst.epoch.load(Ordering::Acquire) != req.epoch {
        log::debug!(target: "fault", "PROPAGATE: {} view changed under {page:#x}", req.dst.id);
        return Ok(Propagated::Stale);
    }
    if let Some(entry) = dst_table.lookup(page) {
        if entry_ppn(entry) == ppn && entry_flags(entry) == flags {
            return Ok(Propagated::Unchanged);
        }
    }
    let prev = dst_table.set_leaf(page, ppn, flags)?;
    match prev {
        Some(old) if entry_ppn(old) == ppn => {}
        Some(old) => {
            mm.frames.get(ppn);
            mm.frames.put(entry_ppn(old));
        }
        None => {
            mm.frames.get(ppn);
            mm.rss.add(req.vma.kind);
        }
    }
    drop(dst_table);
    drop(src_table);
    log::trace!(
        target: "fault",
        "PROPAGATE: {} <- {} at {page:#x} frame={ppn} flags={flags:?}",
        req.dst.id,
        req.src
    );
    Ok(if fresh { Propagated::Populated } else { Propagated::Copied })
}
