// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table-view manager and per-address-space isolation state
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: MemView (registry, membership and view inspection methods)
//! DEPENDS_ON: slot::SlotTable, mm::{Mm, PageTable}, parking_lot
//! INVARIANTS: Exactly one page-table root per live context; the master context aliases the
//!             address space's original root and is only reaped at teardown
//!
//! The master root is canonical. Its leaves carry the full region protection so that
//! any private view can be filled from it, and only private views get leaves narrowed
//! to the capabilities held. The master's own accesses are still validated against its
//! capabilities on the fault path (`AddressSpace::handle_fault`/`access`).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cap::Capability;
use crate::config::Config;
use crate::context::Context;
use crate::domain::Domain;
use crate::error::{Error, Result, SlotKind};
use crate::mm::{entry_flags, entry_ppn, Mm, PageFlags, PageTable, Pfn, Vma};
use crate::slot::SlotTable;
use crate::types::{ContextId, DomainId, GLOBAL_DOMAIN, MASTER_CONTEXT};

pub(crate) struct Metadata {
    pub(crate) domains: SlotTable<Domain>,
    pub(crate) contexts: SlotTable<Context>,
    /// Context the next spawned task joins.
    pub(crate) standby: Option<ContextId>,
}

/// Isolation state of one address space: domain and context tables plus per-context views.
pub struct MemView {
    pub(crate) mm: Arc<Mm>,
    pub(crate) config: Config,
    pub(crate) meta: Mutex<Metadata>,
    current: Mutex<Option<ContextId>>,
}

impl MemView {
    pub(crate) fn new(mm: Arc<Mm>, config: Config) -> Self {
        let meta = Metadata {
            domains: SlotTable::new(config.max_domains),
            contexts: SlotTable::new(config.max_contexts),
            standby: None,
        };
        Self { mm, config, meta: Mutex::new(meta), current: Mutex::new(None) }
    }

    /// Creates the master context and the global domain and hands every existing region
    /// to the global domain.
    pub(crate) fn bootstrap(&self) -> Result<()> {
        let context = self.context_create()?;
        let domain = match self.domain_create() {
            Ok(domain) => domain,
            Err(err) => {
                self.reap_master();
                return Err(err);
            }
        };
        debug_assert_eq!(context, MASTER_CONTEXT);
        debug_assert_eq!(domain, GLOBAL_DOMAIN);
        self.join(domain, context)?;
        self.priv_add(domain, context, Capability::all())?;
        let claimed = self.mm.regions.write().claim_all(domain);
        log::info!(
            target: "memview",
            "MEMVIEW: enabled; {context} holds {domain}, claimed {claimed} regions"
        );
        Ok(())
    }

    /// Configuration this view was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn check_domain(&self, id: DomainId) -> Result<()> {
        if id.index() >= self.config.max_domains {
            return Err(Error::OutOfRange { kind: SlotKind::Domain, id: u64::from(id.raw()) });
        }
        Ok(())
    }

    pub(crate) fn check_context(&self, id: ContextId) -> Result<()> {
        if id.index() >= self.config.max_contexts {
            return Err(Error::OutOfRange { kind: SlotKind::Context, id: u64::from(id.raw()) });
        }
        Ok(())
    }

    pub(crate) fn live_domain(&self, id: DomainId) -> Result<Arc<Domain>> {
        self.check_domain(id)?;
        self.meta.lock().domains.get_live(id.index()).cloned().ok_or(Error::not_found_domain(id))
    }

    pub(crate) fn live_context(&self, id: ContextId) -> Result<Arc<Context>> {
        self.check_context(id)?;
        self.meta
            .lock()
            .contexts
            .get_live(id.index())
            .cloned()
            .ok_or(Error::not_found_context(id))
    }

    /// Allocates the page-table root for a new context.
    pub(crate) fn alloc_root(&self, id: ContextId) -> Result<Arc<Mutex<PageTable>>> {
        if id.is_master() {
            return Ok(self.mm.root.clone());
        }
        let table = PageTable::new(self.mm.frames.clone()).map_err(|err| {
            log::warn!(target: "pt", "PT-ALLOC: no root for {id}: {err}");
            Error::from(err)
        })?;
        Ok(Arc::new(Mutex::new(table)))
    }

    /// Releases every entry and lower-level table private to `context`.
    ///
    /// The root itself goes back to the pool when the last reference to the
    /// context is dropped. No-op for the master context.
    pub(crate) fn free_subtree(&self, context: &Context) {
        if context.id.is_master() {
            return;
        }
        let regions = self.mm.regions.read();
        let mut root = context.root.lock();
        context.epoch.fetch_add(1, Ordering::AcqRel);
        let mut released = 0;
        for vma in regions.iter() {
            let removed = root.clear_range(vma.start, vma.end);
            released += removed.len();
            self.mm.release_leaves(vma.kind, &removed);
        }
        let tables = root.prune();
        log::debug!(
            target: "pt",
            "PT-FREE: {} released {released} entries, {tables} tables",
            context.id
        );
    }

    /// Drops the entries of `context` that cover regions owned by `domain`.
    pub(crate) fn revoke_view(&self, context: &Context, domain: DomainId) {
        if context.id.is_master() {
            return;
        }
        let regions = self.mm.regions.read();
        let mut root = context.root.lock();
        context.epoch.fetch_add(1, Ordering::AcqRel);
        let mut released = 0;
        for vma in regions.owned_by(domain) {
            let removed = root.clear_range(vma.start, vma.end);
            released += removed.len();
            self.mm.release_leaves(vma.kind, &removed);
        }
        if released > 0 {
            log::debug!(target: "pt", "PT-REVOKE: {} dropped {released} entries of {domain}", context.id);
        }
    }

    /// Non-master contexts that still hold a page-table root.
    pub(crate) fn private_views(&self) -> Vec<Arc<Context>> {
        self.meta
            .lock()
            .contexts
            .occupied()
            .filter(|(index, _)| *index != MASTER_CONTEXT.index())
            .map(|(_, context)| context.clone())
            .collect()
    }

    /// Removes every region owned by `domain` and drops its pages from the master
    /// root and every private view. Returns the number of regions removed.
    pub(crate) fn unmap_domain(&self, domain: DomainId) -> usize {
        let mut regions = self.mm.regions.write();
        let owned: Vec<Vma> = regions.owned_by(domain).copied().collect();
        if owned.is_empty() {
            return 0;
        }
        let views = self.private_views();
        for vma in &owned {
            regions.remove(vma.start);
            self.mm.clear_everywhere(vma, &views);
        }
        owned.len()
    }

    /// Leaf entry for `addr` in the view of `context`, as `(frame, flags)`.
    pub fn view_entry(&self, context: ContextId, addr: usize) -> Result<Option<(Pfn, PageFlags)>> {
        let ctx = self.live_context(context)?;
        let page = addr & !(crate::mm::PAGE_SIZE - 1);
        let entry = ctx.root.lock().lookup(page);
        Ok(entry.map(|entry| (entry_ppn(entry), entry_flags(entry))))
    }

    /// Number of populated leaf entries in the view of `context`.
    pub fn view_len(&self, context: ContextId) -> Result<usize> {
        let ctx = self.live_context(context)?;
        let len = ctx.root.lock().leaves().len();
        Ok(len)
    }

    /// Number of table pages, root included, owned by the view of `context`.
    pub fn view_table_pages(&self, context: ContextId) -> Result<usize> {
        let ctx = self.live_context(context)?;
        let pages = ctx.root.lock().table_pages();
        Ok(pages)
    }

    /// Pairs where a capability bit is set without the matching membership bit.
    pub fn membership_violations(&self) -> Vec<(DomainId, ContextId)> {
        let meta = self.meta.lock();
        let mut violations = Vec::new();
        for (index, domain) in meta.domains.occupied() {
            let caps = domain.caps.lock();
            for holder in caps.holders() {
                let joined = meta
                    .contexts
                    .get_occupied(holder.index())
                    .is_some_and(|ctx| ctx.joined.lock().test(index));
                if !joined {
                    violations.push((DomainId::from_index(index), holder));
                }
            }
        }
        violations
    }

    /// Context-switch hook: records which context is running.
    pub(crate) fn record_switch(&self, context: Option<ContextId>) {
        *self.current.lock() = context;
    }

    /// Context recorded by the last switch.
    pub fn active_context(&self) -> Option<ContextId> {
        *self.current.lock()
    }

    /// Kills every context and domain. Safe to call repeatedly.
    pub fn teardown(&self) {
        self.context_free_all();
        self.reap_master();
        self.domain_free_all();
        *self.current.lock() = None;
        log::debug!(target: "memview", "MEMVIEW: torn down");
    }
}
