// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame pool with per-frame reference counts.
//!
//! Data pages and page-table pages are drawn from the same pool, so exhausting
//! it surfaces as `OutOfMemory` on whichever path allocates next.

use parking_lot::Mutex;

/// Physical frame number.
pub type Pfn = usize;

struct FrameState {
    refcounts: Vec<u32>,
    /// Free frames; starts in descending order so early allocations are the lowest.
    free: Vec<Pfn>,
}

/// Fixed pool of physical frames.
pub struct FrameTable {
    state: Mutex<FrameState>,
}

impl FrameTable {
    /// Creates a pool of `capacity` free frames numbered `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FrameState {
                refcounts: vec![0; capacity],
                free: (0..capacity).rev().collect(),
            }),
        }
    }

    /// Allocates a free frame with a reference count of one.
    pub fn alloc(&self) -> Option<Pfn> {
        let mut state = self.state.lock();
        let pfn = state.free.pop()?;
        state.refcounts[pfn] = 1;
        Some(pfn)
    }

    /// Takes an extra reference on an allocated frame.
    pub fn get(&self, pfn: Pfn) {
        let mut state = self.state.lock();
        if let Some(count) = state.refcounts.get_mut(pfn) {
            if *count > 0 {
                *count += 1;
            } else {
                log::error!(target: "pt", "FRAME: get on free frame {pfn}");
            }
        }
    }

    /// Drops a reference; returns true when the frame went back to the pool.
    pub fn put(&self, pfn: Pfn) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(count) = state.refcounts.get_mut(pfn) else {
            return false;
        };
        match *count {
            0 => {
                log::error!(target: "pt", "FRAME: put on free frame {pfn}");
                false
            }
            1 => {
                *count = 0;
                state.free.push(pfn);
                true
            }
            _ => {
                *count -= 1;
                false
            }
        }
    }

    /// Current reference count of `pfn` (0 when free).
    pub fn refcount(&self, pfn: Pfn) -> u32 {
        self.state.lock().refcounts.get(pfn).copied().unwrap_or(0)
    }

    /// Frames currently in the pool.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Total frames managed.
    pub fn capacity(&self) -> usize {
        self.state.lock().refcounts.len()
    }
}
