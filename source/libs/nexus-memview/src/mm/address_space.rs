// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address space owning the frame pool, the original root, the regions and the
//! optional isolation state.
//!
//! Tasks outside the isolation model and the master context share the original
//! root. Every other context faults into its own view and is served from the
//! original root by the lazy propagator.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use super::frame::{FrameTable, Pfn};
use super::page_table::{entry_flags, entry_ppn, PageFlags, PageTable, PAGE_SIZE};
use super::vma::{RegionKind, Vma, VmaMap};
use crate::cap::Capability;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fault::propagate::{propagate, Propagated, Propagation};
use crate::fault::{AccessViolation, FaultCode, FaultOutcome, Verdict, ViolationReason};
use crate::types::{ContextId, DomainId, GLOBAL_DOMAIN, MASTER_CONTEXT};
use crate::view::MemView;

const PROT_MASK: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Resident pages per region kind.
#[derive(Debug, Default)]
pub(crate) struct RssCounters {
    anonymous: AtomicUsize,
    file: AtomicUsize,
    shared: AtomicUsize,
}

impl RssCounters {
    fn counter(&self, kind: RegionKind) -> &AtomicUsize {
        match kind {
            RegionKind::Anonymous => &self.anonymous,
            RegionKind::File => &self.file,
            RegionKind::Shared => &self.shared,
        }
    }

    pub(crate) fn add(&self, kind: RegionKind) {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub(&self, kind: RegionKind, pages: usize) {
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(pages)));
    }

    pub(crate) fn get(&self, kind: RegionKind) -> usize {
        self.counter(kind).load(Ordering::Acquire)
    }
}

/// Memory state shared between the address space and its isolation view.
pub(crate) struct Mm {
    pub(crate) frames: Arc<FrameTable>,
    /// Original root; the master context aliases it.
    pub(crate) root: Arc<Mutex<PageTable>>,
    pub(crate) regions: RwLock<VmaMap>,
    pub(crate) rss: RssCounters,
}

impl Mm {
    fn new(frames: usize) -> Result<Self> {
        let frames = Arc::new(FrameTable::new(frames));
        let root = PageTable::new(frames.clone())?;
        Ok(Self {
            frames,
            root: Arc::new(Mutex::new(root)),
            regions: RwLock::new(VmaMap::default()),
            rss: RssCounters::default(),
        })
    }

    /// Maps a fresh page at `page` in `table` unless one is already there.
    ///
    /// Returns the frame and whether it was freshly allocated.
    pub(crate) fn populate_locked(
        &self,
        table: &mut PageTable,
        page: usize,
        vma: &Vma,
    ) -> Result<(Pfn, bool)> {
        if let Some(entry) = table.lookup(page) {
            return Ok((entry_ppn(entry), false));
        }
        let pfn = self.frames.alloc().ok_or(Error::OutOfMemory)?;
        if let Err(err) = table.set_leaf(page, pfn, canonical_flags(vma.prot)) {
            self.frames.put(pfn);
            return Err(err.into());
        }
        self.rss.add(vma.kind);
        Ok((pfn, true))
    }

    /// Clears `vma` from the original root and from each of `views`.
    pub(crate) fn clear_everywhere(&self, vma: &Vma, views: &[Arc<Context>]) {
        let removed = self.root.lock().clear_range(vma.start, vma.end);
        self.release_leaves(vma.kind, &removed);
        for context in views {
            let removed = context.root.lock().clear_range(vma.start, vma.end);
            self.release_leaves(vma.kind, &removed);
        }
    }

    /// Drops the frame reference held by each removed leaf.
    pub(crate) fn release_leaves(&self, kind: RegionKind, removed: &[(usize, usize)]) {
        for (_, entry) in removed {
            self.frames.put(entry_ppn(*entry));
        }
        self.rss.sub(kind, removed.len());
    }
}

fn canonical_flags(prot: PageFlags) -> PageFlags {
    PageFlags::VALID | PageFlags::USER | (prot & PROT_MASK)
}

/// Violation reported when propagation fails for a reason other than memory exhaustion.
fn propagation_failure(context: ContextId, err: Error) -> ViolationReason {
    match err {
        Error::Map(err) => ViolationReason::PageTable(err),
        Error::NoMapping { .. } => ViolationReason::NoMapping,
        // The faulting or source view was released while the fault was in flight.
        _ => ViolationReason::ContextGone { context },
    }
}

fn region_permits(vma: &Vma, code: FaultCode) -> bool {
    if code.contains(FaultCode::WRITE) {
        vma.prot.contains(PageFlags::WRITE)
    } else if code.contains(FaultCode::INSTRUCTION) {
        vma.prot.contains(PageFlags::EXECUTE)
    } else {
        vma.prot.contains(PageFlags::READ)
    }
}

/// Thread handle as seen by the memory subsystem.
#[derive(Debug, PartialEq, Eq)]
pub struct Task {
    tid: u64,
    context: Option<ContextId>,
    mmap_domain: Option<DomainId>,
}

impl Task {
    /// Thread id.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Context the task runs in; `None` when it does not use the isolation model.
    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    /// Domain new mappings are tagged with; the global domain when unset.
    pub fn mmap_domain(&self) -> DomainId {
        self.mmap_domain.unwrap_or(GLOBAL_DOMAIN)
    }
}

/// One address space with optional intra-process isolation.
pub struct AddressSpace {
    mm: Arc<Mm>,
    config: Config,
    memview: OnceLock<MemView>,
    enable: Mutex<()>,
    next_tid: AtomicU64,
}

impl AddressSpace {
    /// Creates an address space with an empty original root.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(|err| {
            log::warn!(target: "memview", "MEMVIEW: rejected config: {err}");
            Error::InvalidArgument("invalid configuration")
        })?;
        let mm = Mm::new(config.physical_frames)?;
        Ok(Self {
            mm: Arc::new(mm),
            config,
            memview: OnceLock::new(),
            enable: Mutex::new(()),
            next_tid: AtomicU64::new(1),
        })
    }

    /// Configuration the address space was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a task handle.
    ///
    /// Once isolation is enabled the task runs in the registered standby context,
    /// or in the master context when none was registered.
    pub fn spawn_task(&self) -> Task {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let context = self.memview.get().map(|view| match view.take_standby() {
            Some(standby) => standby,
            None => {
                view.task_enter(MASTER_CONTEXT);
                MASTER_CONTEXT
            }
        });
        log::trace!(target: "memview", "TASK-SPAWN: tid={tid} context={context:?}");
        Task { tid, context, mmap_domain: None }
    }

    /// Retires a task handle.
    pub fn exit_task(&self, task: Task) {
        if let (Some(view), Some(context)) = (self.memview.get(), task.context) {
            view.task_exit(context);
        }
    }

    /// Switches the address space to the isolation model with `task` as the master.
    pub fn enable_isolation(&self, task: &mut Task) -> Result<()> {
        let _guard = self.enable.lock();
        if self.memview.get().is_some() {
            return Err(Error::AlreadyEnabled);
        }
        let view = MemView::new(self.mm.clone(), self.config.clone());
        view.bootstrap()?;
        self.memview.set(view).map_err(|_| Error::AlreadyEnabled)?;
        self.isolation()?.task_enter(MASTER_CONTEXT);
        task.context = Some(MASTER_CONTEXT);
        Ok(())
    }

    /// Isolation state, once enabled.
    pub fn isolation(&self) -> Result<&MemView> {
        self.memview.get().ok_or(Error::NotEnabled)
    }

    /// True once isolation was enabled.
    pub fn is_isolated(&self) -> bool {
        self.memview.get().is_some()
    }

    /// Tags the next mappings created by `task` with `domain`.
    pub fn mmap_register(&self, task: &mut Task, domain: DomainId) -> Result<()> {
        self.isolation()?.live_domain(domain)?;
        task.mmap_domain = Some(domain);
        log::debug!(target: "memview", "MMAP-REGISTER: tid={} -> {domain}", task.tid);
        Ok(())
    }

    /// Maps `len` bytes (rounded up to pages) in the task's mmap domain.
    ///
    /// A non-master context needs ALLOCATE in that domain. WRITE implies READ.
    pub fn mmap(&self, task: &Task, len: usize, prot: PageFlags, kind: RegionKind) -> Result<usize> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length mapping"));
        }
        let mut prot = prot & PROT_MASK;
        if prot.is_empty() {
            return Err(Error::InvalidArgument("mapping needs READ, WRITE or EXECUTE"));
        }
        if prot.contains(PageFlags::WRITE) {
            prot |= PageFlags::READ;
        }
        let len = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(Error::InvalidArgument("mapping too large"))?
            & !(PAGE_SIZE - 1);

        let mut regions = self.mm.regions.write();
        let domain = task.mmap_domain();
        if let Some(view) = self.memview.get() {
            view.live_domain(domain)?;
            if let Some(context) = task.context.filter(|context| !context.is_master()) {
                let held = view.priv_get(domain, context).unwrap_or(Capability::empty());
                if !held.contains(Capability::ALLOCATE) {
                    log::warn!(target: "memview", "MMAP: {context} lacks ALLOCATE in {domain}");
                    return Err(Error::MissingCapability {
                        domain,
                        context,
                        required: Capability::ALLOCATE,
                    });
                }
            }
        }
        let start = regions.find_free(len).ok_or(Error::OutOfMemory)?;
        let vma = Vma { start, end: start + len, prot, kind, domain };
        if !regions.insert(vma) {
            return Err(Error::InvalidArgument("region overlaps an existing mapping"));
        }
        log::debug!(target: "memview", "MMAP: {start:#x}..{:#x} {prot:?} in {domain}", start + len);
        Ok(start)
    }

    /// Unmaps the region starting at `addr` and drops its entries from every view.
    pub fn munmap(&self, addr: usize) -> Result<()> {
        let mut regions = self.mm.regions.write();
        let vma = regions.remove(addr).ok_or(Error::NoMapping { addr })?;
        let views = self.memview.get().map(MemView::private_views).unwrap_or_default();
        self.mm.clear_everywhere(&vma, &views);
        drop(regions);
        log::debug!(target: "memview", "MUNMAP: {:#x}..{:#x}", vma.start, vma.end);
        Ok(())
    }

    /// Domain owning the region that covers `addr`.
    pub fn query_domain(&self, addr: usize) -> Result<DomainId> {
        self.mm.regions.read().find(addr).map(|vma| vma.domain).ok_or(Error::NoMapping { addr })
    }

    /// The global domain, while isolation is enabled and it is alive.
    pub fn global_domain(&self) -> Result<DomainId> {
        self.isolation()?.global_domain()
    }

    /// Context `task` runs in.
    pub fn current_context(&self, task: &Task) -> Result<ContextId> {
        self.isolation()?;
        task.context.ok_or(Error::NotEnabled)
    }

    /// Context-switch hook: records the context of the task being switched in.
    pub fn switch_to(&self, task: &Task) {
        if let Some(view) = self.memview.get() {
            view.record_switch(task.context);
        }
    }

    /// Entry visible to `task` at `addr`, as `(frame, flags)`.
    pub fn translate(&self, task: &Task, addr: usize) -> Option<(Pfn, PageFlags)> {
        let page = Vma::page_of(addr);
        let entry = match (self.memview.get(), task.context) {
            (Some(view), Some(context)) if !context.is_master() => {
                view.live_context(context).ok()?.root.lock().lookup(page)
            }
            _ => self.mm.root.lock().lookup(page),
        };
        entry.map(|entry| (entry_ppn(entry), entry_flags(entry)))
    }

    /// Handles a page fault raised by `task` at `addr`.
    pub fn handle_fault(&self, task: &Task, addr: usize, code: FaultCode) -> FaultOutcome {
        let regions = self.mm.regions.read();
        let violation = |reason| FaultOutcome::Violation(AccessViolation { addr, code, reason });
        let Some(vma) = regions.find(addr).copied() else {
            log::warn!(target: "fault", "FAULT: tid={} no mapping at {addr:#x}", task.tid);
            return violation(ViolationReason::NoMapping);
        };
        if !region_permits(&vma, code) {
            log::warn!(target: "fault", "FAULT: tid={} {code:?} denied by region at {addr:#x}", task.tid);
            return violation(ViolationReason::RegionProtection);
        }
        let (Some(view), Some(context)) = (self.memview.get(), task.context) else {
            return self.fault_original(addr, code, &vma);
        };
        let Ok(ctx) = view.live_context(context) else {
            return violation(ViolationReason::ContextGone { context });
        };
        let epoch = ctx.epoch.load(Ordering::Acquire);
        let caps = match view.validate(Some(context), vma.domain, code) {
            Verdict::PassThrough => return self.fault_original(addr, code, &vma),
            Verdict::Reject(rejection) => {
                let rejected = AccessViolation::rejected(addr, code, rejection);
                log::warn!(target: "fault", "FAULT: tid={} {rejected}", task.tid);
                return FaultOutcome::Violation(rejected);
            }
            Verdict::Accept { caps, .. } => caps,
        };
        if context.is_master() {
            return self.fault_original(addr, code, &vma);
        }
        let request = Propagation {
            dst: &ctx,
            src: MASTER_CONTEXT,
            caller: context,
            addr,
            vma: &vma,
            caps,
            epoch,
        };
        match propagate(view, request) {
            Ok(Propagated::Copied) => FaultOutcome::Minor,
            Ok(Propagated::Populated) => FaultOutcome::Major,
            Ok(Propagated::Unchanged | Propagated::Stale) => FaultOutcome::Spurious,
            Err(Error::OutOfMemory) => {
                log::warn!(target: "fault", "FAULT: out of memory at {addr:#x} for {context}");
                FaultOutcome::OutOfMemory
            }
            Err(err) => {
                log::warn!(target: "fault", "FAULT: propagation for {context} failed: {err}");
                violation(propagation_failure(context, err))
            }
        }
    }

    /// Runs the fault path for an access and reports violations as errors.
    pub fn access(&self, task: &Task, addr: usize, code: FaultCode) -> Result<FaultOutcome> {
        match self.handle_fault(task, addr, code) {
            FaultOutcome::Violation(violation) => Err(violation.to_error()),
            FaultOutcome::OutOfMemory => Err(Error::OutOfMemory),
            outcome => Ok(outcome),
        }
    }

    /// Resident pages charged to `kind`, counted once per (page, view).
    pub fn resident(&self, kind: RegionKind) -> usize {
        self.mm.rss.get(kind)
    }

    /// Frames left in the pool.
    pub fn free_frames(&self) -> usize {
        self.mm.frames.free_count()
    }

    /// Reference count of a frame.
    pub fn frame_refcount(&self, pfn: Pfn) -> u32 {
        self.mm.frames.refcount(pfn)
    }

    /// Destroys every context, domain and region. Safe to call repeatedly.
    pub fn teardown(&self) {
        if let Some(view) = self.memview.get() {
            view.teardown();
        }
        let mut regions = self.mm.regions.write();
        let mut root = self.mm.root.lock();
        let vmas: Vec<Vma> = regions.iter().copied().collect();
        for vma in vmas {
            let removed = root.clear_range(vma.start, vma.end);
            self.mm.release_leaves(vma.kind, &removed);
            regions.remove(vma.start);
        }
        root.prune();
    }

    /// Fault path for the original root: tasks outside the model and the master context.
    fn fault_original(&self, addr: usize, code: FaultCode, vma: &Vma) -> FaultOutcome {
        let page = Vma::page_of(addr);
        let mut root = self.mm.root.lock();
        match self.mm.populate_locked(&mut root, page, vma) {
            Ok((_, true)) => FaultOutcome::Major,
            Ok((_, false)) => FaultOutcome::Spurious,
            Err(Error::OutOfMemory) => FaultOutcome::OutOfMemory,
            Err(err) => {
                log::error!(target: "pt", "PT-POPULATE: {addr:#x}: {err}");
                let reason = match err {
                    Error::Map(err) => ViolationReason::PageTable(err),
                    _ => ViolationReason::NoMapping,
                };
                FaultOutcome::Violation(AccessViolation { addr, code, reason })
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}
