// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity slot arena shared by the domain and context registries.
//!
//! A slot moves through three states: free, live (visible to lookups) and
//! retired (killed but not yet released). `reserve` only hands out slots that
//! are free, so an id is reused only after its previous occupant was fully
//! torn down.

use std::sync::Arc;

use crate::bitmap::SlotBitmap;

pub(crate) struct SlotTable<T> {
    live: SlotBitmap,
    occupied: SlotBitmap,
    slots: Vec<Option<Arc<T>>>,
}

impl<T> SlotTable<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            live: SlotBitmap::new(capacity),
            occupied: SlotBitmap::new(capacity),
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lowest slot that is neither live nor retired.
    pub(crate) fn reserve(&self) -> Option<usize> {
        self.occupied.first_clear()
    }

    pub(crate) fn install(&mut self, index: usize, value: Arc<T>) {
        self.live.set(index);
        self.occupied.set(index);
        self.slots[index] = Some(value);
    }

    /// Clears the live bit; returns the entry if it was live.
    pub(crate) fn retire(&mut self, index: usize) -> Option<Arc<T>> {
        if !self.live.clear(index) {
            return None;
        }
        self.slots[index].clone()
    }

    /// Drops the entry and frees the slot for reuse.
    pub(crate) fn release(&mut self, index: usize) -> Option<Arc<T>> {
        self.live.clear(index);
        self.occupied.clear(index);
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub(crate) fn get_live(&self, index: usize) -> Option<&Arc<T>> {
        if !self.live.test(index) {
            return None;
        }
        self.slots[index].as_ref()
    }

    pub(crate) fn get_occupied(&self, index: usize) -> Option<&Arc<T>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn is_live(&self, index: usize) -> bool {
        self.live.test(index)
    }

    pub(crate) fn first_live(&self) -> Option<usize> {
        self.live.first_set()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.count()
    }

    pub(crate) fn occupied(&self) -> impl Iterator<Item = (usize, &Arc<T>)> + '_ {
        self.occupied
            .iter()
            .filter_map(move |index| self.slots[index].as_ref().map(|value| (index, value)))
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = (usize, &Arc<T>)> + '_ {
        self.live.iter().filter_map(move |index| self.slots[index].as_ref().map(|value| (index, value)))
    }
}
