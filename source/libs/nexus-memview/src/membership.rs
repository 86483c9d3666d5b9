// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Join/leave and capability operations on (domain, context) pairs
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemView::{join, leave, is_member, priv_add, priv_del, priv_mod, priv_get}
//! INVARIANTS: A capability bit is set only while the matching membership bit is set;
//!             domain mutex is always taken before the context mutex

use std::sync::Arc;

use crate::cap::{Capability, CapabilityTable};
use crate::context::Context;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::types::{ContextId, DomainId};
use crate::view::MemView;

impl MemView {
    /// Makes `context` a member of `domain` without granting any capability.
    pub fn join(&self, domain: DomainId, context: ContextId) -> Result<()> {
        self.check_domain(domain)?;
        self.check_context(context)?;
        let meta = self.meta.lock();
        if !meta.domains.is_live(domain.index()) {
            return Err(Error::not_found_domain(domain));
        }
        let ctx = meta.contexts.get_live(context.index()).ok_or(Error::not_found_context(context))?;
        ctx.joined.lock().set(domain.index());
        log::debug!(target: "domain", "DOMAIN-JOIN: {context} joined {domain}");
        Ok(())
    }

    /// Removes `context` from `domain`, clearing all four capability bits.
    ///
    /// A non-master context also loses every view entry for the domain's regions.
    pub fn leave(&self, domain: DomainId, context: ContextId) -> Result<()> {
        let (dom, ctx) = self.pair(domain, context)?;
        if !self.leave_locked(&dom, &ctx) {
            return Err(Error::NotAMember { domain, context });
        }
        self.revoke_view(&ctx, domain);
        log::debug!(target: "domain", "DOMAIN-LEAVE: {context} left {domain}");
        Ok(())
    }

    /// True when `context` has joined `domain`. Unknown ids are never members.
    pub fn is_member(&self, domain: DomainId, context: ContextId) -> bool {
        match self.pair(domain, context) {
            Ok((_, ctx)) => ctx.joined.lock().test(domain.index()),
            Err(_) => false,
        }
    }

    /// Grants `caps` to a member.
    pub fn priv_add(&self, domain: DomainId, context: ContextId, caps: Capability) -> Result<()> {
        self.update_caps(domain, context, |table| table.grant(context, caps))?;
        log::debug!(target: "domain", "DOMAIN-PRIV: {context} +{caps:?} in {domain}");
        Ok(())
    }

    /// Revokes `caps` from a member and drops its view entries for the domain.
    pub fn priv_del(&self, domain: DomainId, context: ContextId, caps: Capability) -> Result<()> {
        let ctx = self.update_caps(domain, context, |table| table.revoke(context, caps))?;
        self.revoke_view(&ctx, domain);
        log::debug!(target: "domain", "DOMAIN-PRIV: {context} -{caps:?} in {domain}");
        Ok(())
    }

    /// Replaces a member's capability mask.
    pub fn priv_mod(&self, domain: DomainId, context: ContextId, caps: Capability) -> Result<()> {
        let ctx = self.update_caps(domain, context, |table| {
            table.revoke(context, Capability::all());
            table.grant(context, caps);
        })?;
        self.revoke_view(&ctx, domain);
        log::debug!(target: "domain", "DOMAIN-PRIV: {context} ={caps:?} in {domain}");
        Ok(())
    }

    /// Capability mask held by a member.
    pub fn priv_get(&self, domain: DomainId, context: ContextId) -> Result<Capability> {
        let (dom, ctx) = self.pair(domain, context)?;
        let caps = dom.caps.lock();
        if !ctx.joined.lock().test(domain.index()) {
            return Err(Error::NotAMember { domain, context });
        }
        Ok(caps.get(context))
    }

    /// Clears both sides of a membership; returns whether the context was a member.
    pub(crate) fn leave_locked(&self, domain: &Domain, context: &Context) -> bool {
        let mut caps = domain.caps.lock();
        let mut joined = context.joined.lock();
        caps.clear(context.id);
        joined.clear(domain.id.index())
    }

    pub(crate) fn pair(
        &self,
        domain: DomainId,
        context: ContextId,
    ) -> Result<(Arc<Domain>, Arc<Context>)> {
        self.check_domain(domain)?;
        self.check_context(context)?;
        let meta = self.meta.lock();
        let dom = meta.domains.get_live(domain.index()).cloned().ok_or(Error::not_found_domain(domain))?;
        let ctx = meta
            .contexts
            .get_live(context.index())
            .cloned()
            .ok_or(Error::not_found_context(context))?;
        Ok((dom, ctx))
    }

    fn update_caps(
        &self,
        domain: DomainId,
        context: ContextId,
        apply: impl FnOnce(&mut CapabilityTable),
    ) -> Result<Arc<Context>> {
        let (dom, ctx) = self.pair(domain, context)?;
        let mut caps = dom.caps.lock();
        if !ctx.joined.lock().test(domain.index()) {
            log::debug!(target: "domain", "DOMAIN-PRIV: {context} is not in {domain}");
            return Err(Error::NotAMember { domain, context });
        }
        apply(&mut *caps);
        drop(caps);
        Ok(ctx)
    }
}
