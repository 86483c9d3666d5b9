// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Context registry (slot allocation, page-table roots, thread registration)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemView::{context_create, context_kill, context_free_all, context_exists,
//!             context_count, register_running, task_count}
//! INVARIANTS: Context 0 is the master context and cannot be killed through `context_kill`;
//!             a killed context leaves every domain before its view is released

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitmap::SlotBitmap;
use crate::cap::Capability;
use crate::error::{Error, Result, SlotKind};
use crate::mm::PageTable;
use crate::types::{ContextId, GLOBAL_DOMAIN, MASTER_CONTEXT};
use crate::view::MemView;

/// An execution context: joined-domain bitmap plus a private page-table root.
pub(crate) struct Context {
    pub(crate) id: ContextId,
    pub(crate) task_count: AtomicU32,
    pub(crate) joined: Mutex<SlotBitmap>,
    pub(crate) root: Arc<Mutex<PageTable>>,
    /// Bumped under the root lock whenever entries are revoked or the view is freed.
    pub(crate) epoch: AtomicU64,
}

impl MemView {
    /// Creates a context in the lowest free slot with an empty view.
    ///
    /// Slot 0 becomes the master context and aliases the original root.
    pub fn context_create(&self) -> Result<ContextId> {
        let mut meta = self.meta.lock();
        let Some(index) = meta.contexts.reserve() else {
            log::warn!(
                target: "context",
                "CONTEXT-CREATE: all {} slots in use",
                meta.contexts.capacity()
            );
            return Err(Error::OutOfSlots(SlotKind::Context));
        };
        let id = ContextId::from_index(index);
        let root = self.alloc_root(id)?;
        let context = Arc::new(Context {
            id,
            task_count: AtomicU32::new(0),
            joined: Mutex::new(SlotBitmap::new(self.config.max_domains)),
            root,
            epoch: AtomicU64::new(0),
        });
        meta.contexts.install(index, context.clone());
        if self.config.allow_global && !id.is_master() {
            if let Some(global) = meta.domains.get_live(GLOBAL_DOMAIN.index()) {
                let mut caps = global.caps.lock();
                context.joined.lock().set(GLOBAL_DOMAIN.index());
                caps.grant(id, Capability::all());
            }
        }
        log::debug!(target: "context", "CONTEXT-CREATE: {id}");
        Ok(id)
    }

    /// Kills a non-master context: leaves every domain, then frees its view.
    pub fn context_kill(&self, id: ContextId) -> Result<()> {
        self.check_context(id)?;
        if id.is_master() {
            log::warn!(target: "context", "CONTEXT-KILL: refusing to kill the master context");
            return Err(Error::MasterContext);
        }
        let context = {
            let mut meta = self.meta.lock();
            let context = meta.contexts.retire(id.index()).ok_or(Error::not_found_context(id))?;
            if meta.standby == Some(id) {
                meta.standby = None;
            }
            context
        };
        self.leave_all(&context);
        self.free_subtree(&context);
        self.meta.lock().contexts.release(id.index());
        log::debug!(target: "context", "CONTEXT-KILL: {id}");
        Ok(())
    }

    /// Kills every non-master context.
    pub fn context_free_all(&self) {
        loop {
            let next = self
                .meta
                .lock()
                .contexts
                .live()
                .map(|(index, _)| index)
                .find(|index| *index != MASTER_CONTEXT.index());
            let Some(index) = next else { break };
            if let Err(err) = self.context_kill(ContextId::from_index(index)) {
                log::debug!(target: "context", "CONTEXT-FREE-ALL: {err}");
            }
        }
    }

    /// True when `id` names a live context.
    pub fn context_exists(&self, id: ContextId) -> bool {
        self.live_context(id).is_ok()
    }

    /// Number of live contexts, master included.
    pub fn context_count(&self) -> usize {
        self.meta.lock().contexts.live_count()
    }

    /// Marks `id` as the context the next spawned task runs in.
    ///
    /// A registration that no task has consumed yet is replaced, and the task it
    /// counted is given back to its context.
    pub fn register_running(&self, id: ContextId) -> Result<()> {
        self.check_context(id)?;
        if id.is_master() {
            return Err(Error::MasterContext);
        }
        let mut meta = self.meta.lock();
        let context = meta.contexts.get_live(id.index()).cloned().ok_or(Error::not_found_context(id))?;
        if let Some(prev) = meta.standby.replace(id) {
            if let Some(prev) = meta.contexts.get_live(prev.index()) {
                let _ = prev
                    .task_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                log::debug!(target: "context", "CONTEXT-REGISTER: {} replaced before spawn", prev.id);
            }
        }
        context.task_count.fetch_add(1, Ordering::AcqRel);
        log::debug!(target: "context", "CONTEXT-REGISTER: next task joins {id}");
        Ok(())
    }

    /// Number of tasks running in `id`.
    pub fn task_count(&self, id: ContextId) -> Result<u32> {
        Ok(self.live_context(id)?.task_count.load(Ordering::Acquire))
    }

    /// Context the next spawned task should run in, if one was registered.
    pub(crate) fn take_standby(&self) -> Option<ContextId> {
        self.meta.lock().standby.take()
    }

    pub(crate) fn task_enter(&self, id: ContextId) {
        if let Ok(context) = self.live_context(id) {
            context.task_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn task_exit(&self, id: ContextId) {
        if let Ok(context) = self.live_context(id) {
            let _ = context
                .task_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Releases the master context; its root stays with the address space.
    pub(crate) fn reap_master(&self) {
        let retired = self.meta.lock().contexts.retire(MASTER_CONTEXT.index());
        if let Some(master) = retired {
            self.leave_all(&master);
            self.meta.lock().contexts.release(MASTER_CONTEXT.index());
            log::debug!(target: "context", "CONTEXT-KILL: master reaped");
        }
    }

    /// Leaves every joined domain, clearing capability bits on the domain side.
    fn leave_all(&self, context: &Context) {
        loop {
            let next = context.joined.lock().first_set();
            let Some(index) = next else { break };
            let domain = self.meta.lock().domains.get_occupied(index).cloned();
            match domain {
                Some(domain) => {
                    self.leave_locked(&domain, context);
                }
                None => {
                    context.joined.lock().clear(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::{Error, SlotKind};
    use crate::mm::AddressSpace;
    use crate::types::{ContextId, GLOBAL_DOMAIN, MASTER_CONTEXT};
    use crate::Capability;

    fn space(config: Config) -> AddressSpace {
        let space = AddressSpace::new(config).unwrap();
        let mut main = space.spawn_task();
        space.enable_isolation(&mut main).unwrap();
        space
    }

    #[test]
    fn master_is_slot_zero_and_cannot_be_killed() {
        let space = space(Config::default());
        let view = space.isolation().unwrap();
        assert!(view.context_exists(MASTER_CONTEXT));
        assert_eq!(view.context_kill(MASTER_CONTEXT), Err(Error::MasterContext));
        assert_eq!(view.context_create(), Ok(ContextId::new(1)));
    }

    #[test]
    fn table_exhaustion_and_reuse() {
        let config = Config { max_contexts: 3, ..Config::default() };
        let space = space(config);
        let view = space.isolation().unwrap();
        let a = view.context_create().unwrap();
        let b = view.context_create().unwrap();
        assert_eq!(view.context_create(), Err(Error::OutOfSlots(SlotKind::Context)));
        view.context_kill(a).unwrap();
        assert_eq!(view.context_create(), Ok(a));
        assert!(view.context_exists(b));
        assert_eq!(view.context_count(), 3);
    }

    #[test]
    fn kill_leaves_every_domain() {
        let space = space(Config::default());
        let view = space.isolation().unwrap();
        let ctx = view.context_create().unwrap();
        let d1 = view.domain_create().unwrap();
        let d2 = view.domain_create().unwrap();
        view.join(d1, ctx).unwrap();
        view.join(d2, ctx).unwrap();
        view.priv_add(d2, ctx, Capability::WRITE).unwrap();
        view.context_kill(ctx).unwrap();
        assert!(!view.context_exists(ctx));
        assert!(view.membership_violations().is_empty());
        assert_eq!(view.context_kill(ctx), Err(Error::NotFound { kind: SlotKind::Context, id: 1 }));
    }

    #[test]
    fn kill_returns_root_to_the_pool() {
        let space = space(Config::default());
        let view = space.isolation().unwrap();
        let free = space.free_frames();
        let ctx = view.context_create().unwrap();
        assert_eq!(space.free_frames(), free - 1);
        view.context_kill(ctx).unwrap();
        assert_eq!(space.free_frames(), free);
    }

    #[test]
    fn register_running_rules() {
        let space = space(Config::default());
        let view = space.isolation().unwrap();
        assert_eq!(view.register_running(MASTER_CONTEXT), Err(Error::MasterContext));
        assert!(matches!(view.register_running(ContextId::new(5)), Err(Error::NotFound { .. })));
        let ctx = view.context_create().unwrap();
        view.register_running(ctx).unwrap();
        assert_eq!(view.task_count(ctx), Ok(1));
        let task = space.spawn_task();
        assert_eq!(task.context(), Some(ctx));
        let other = space.spawn_task();
        assert_eq!(other.context(), Some(MASTER_CONTEXT));
        space.exit_task(task);
        assert_eq!(view.task_count(ctx), Ok(0));
    }

    #[test]
    fn reregistering_before_spawn_moves_the_count() {
        let space = space(Config::default());
        let view = space.isolation().unwrap();
        let a = view.context_create().unwrap();
        let b = view.context_create().unwrap();
        view.register_running(a).unwrap();
        view.register_running(b).unwrap();
        assert_eq!(view.task_count(a), Ok(0));
        assert_eq!(view.task_count(b), Ok(1));
        view.register_running(b).unwrap();
        assert_eq!(view.task_count(b), Ok(1));

        let task = space.spawn_task();
        assert_eq!(task.context(), Some(b));
        space.exit_task(task);
        assert_eq!(view.task_count(b), Ok(0));
        assert_eq!(view.task_count(a), Ok(0));
    }

    #[test]
    fn allow_global_grants_full_access_to_new_contexts() {
        let space = space(Config { allow_global: true, ..Config::default() });
        let view = space.isolation().unwrap();
        let ctx = view.context_create().unwrap();
        assert!(view.is_member(GLOBAL_DOMAIN, ctx));
        assert_eq!(view.priv_get(GLOBAL_DOMAIN, ctx), Ok(Capability::all()));
    }

    #[test]
    fn create_fails_cleanly_without_frames() {
        let config = Config { physical_frames: 8, ..Config::default() };
        let space = AddressSpace::new(config).unwrap();
        let mut main = space.spawn_task();
        space.enable_isolation(&mut main).unwrap();
        let view = space.isolation().unwrap();
        let mut created = 0;
        while view.context_create().is_ok() {
            created += 1;
        }
        assert_eq!(created, 7);
        assert_eq!(view.context_create(), Err(Error::OutOfMemory));
        assert_eq!(view.context_count(), 8);
    }
}
