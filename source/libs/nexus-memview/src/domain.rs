// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Domain registry (slot allocation, kill with forced leave, teardown)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemView::{domain_create, domain_kill, domain_free_all, domain_exists,
//!             domain_count, global_domain}
//! INVARIANTS: A killed domain's slot is reused only after every member has left and its
//!             regions are unmapped; the global domain is reclaimed only by `domain_free_all`

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cap::CapabilityTable;
use crate::context::Context;
use crate::error::{Error, Result, SlotKind};
use crate::types::{DomainId, GLOBAL_DOMAIN};
use crate::view::MemView;

/// A memory domain: capability bitmaps indexed by context id.
pub(crate) struct Domain {
    pub(crate) id: DomainId,
    pub(crate) caps: Mutex<CapabilityTable>,
}

impl Domain {
    fn new(id: DomainId, contexts: usize) -> Self {
        Self { id, caps: Mutex::new(CapabilityTable::new(contexts)) }
    }
}

impl MemView {
    /// Creates a domain in the lowest free slot.
    pub fn domain_create(&self) -> Result<DomainId> {
        let mut meta = self.meta.lock();
        let Some(index) = meta.domains.reserve() else {
            log::warn!(
                target: "domain",
                "DOMAIN-CREATE: all {} slots in use",
                meta.domains.capacity()
            );
            return Err(Error::OutOfSlots(SlotKind::Domain));
        };
        let id = DomainId::from_index(index);
        meta.domains.install(index, Arc::new(Domain::new(id, self.config.max_contexts)));
        log::debug!(target: "domain", "DOMAIN-CREATE: {id}");
        Ok(id)
    }

    /// Kills `id`, forcing every member to leave and unmapping its regions before the
    /// slot is released. The global domain is refused.
    pub fn domain_kill(&self, id: DomainId) -> Result<()> {
        self.check_domain(id)?;
        if id.is_global() {
            log::warn!(target: "domain", "DOMAIN-KILL: refusing to kill the global domain");
            return Err(Error::GlobalDomain);
        }
        self.kill_domain(id)
    }

    /// Kills the lowest live domain until none remain, the global domain included.
    pub fn domain_free_all(&self) {
        loop {
            let next = self.meta.lock().domains.first_live();
            let Some(index) = next else { break };
            if let Err(err) = self.kill_domain(DomainId::from_index(index)) {
                log::debug!(target: "domain", "DOMAIN-FREE-ALL: {err}");
            }
        }
    }

    fn kill_domain(&self, id: DomainId) -> Result<()> {
        let domain = self
            .meta
            .lock()
            .domains
            .retire(id.index())
            .ok_or(Error::not_found_domain(id))?;
        let mut evicted = 0;
        while let Some(member) = self.next_member(&domain) {
            self.detach(&domain, &member);
            evicted += 1;
        }
        let unmapped = self.unmap_domain(id);
        self.meta.lock().domains.release(id.index());
        log::debug!(
            target: "domain",
            "DOMAIN-KILL: {id} evicted {evicted} contexts, unmapped {unmapped} regions"
        );
        Ok(())
    }

    /// True when `id` names a live domain.
    pub fn domain_exists(&self, id: DomainId) -> bool {
        self.live_domain(id).is_ok()
    }

    /// Number of live domains.
    pub fn domain_count(&self) -> usize {
        self.meta.lock().domains.live_count()
    }

    /// Returns the global domain while it is alive.
    pub fn global_domain(&self) -> Result<DomainId> {
        self.live_domain(GLOBAL_DOMAIN).map(|domain| domain.id)
    }

    /// First context still holding a capability or membership in `domain`.
    fn next_member(&self, domain: &Domain) -> Option<Arc<Context>> {
        let meta = self.meta.lock();
        loop {
            let holder = domain.caps.lock().first_holder();
            let Some(holder) = holder else { break };
            match meta.contexts.get_occupied(holder.index()) {
                Some(ctx) => return Some(ctx.clone()),
                // Bits left behind by a context that no longer exists.
                None => domain.caps.lock().clear(holder),
            }
        }
        for (_, ctx) in meta.contexts.occupied() {
            if ctx.joined.lock().test(domain.id.index()) {
                return Some(ctx.clone());
            }
        }
        None
    }

    /// Clears both sides of the membership and drops the context's entries for the domain.
    pub(crate) fn detach(&self, domain: &Domain, context: &Context) {
        self.leave_locked(domain, context);
        self.revoke_view(context, domain.id);
    }
}
