// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity bit set over slot indices
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SlotBitmap
//! INVARIANTS: Bits at or beyond `len()` are never set

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-size bit-vector with first-set/first-clear scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
}

impl SlotBitmap {
    /// Creates an empty bitmap able to hold `len` bits.
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(WORD_BITS)], len }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether `index` is set. Out-of-range indices read as clear.
    pub fn test(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Sets `index` and returns its previous value. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let prev = *word & mask != 0;
        *word |= mask;
        prev
    }

    /// Clears `index` and returns its previous value.
    pub fn clear(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let prev = *word & mask != 0;
        *word &= !mask;
        prev
    }

    /// Lowest set index.
    pub fn first_set(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            (*word != 0).then(|| i * WORD_BITS + word.trailing_zeros() as usize)
        })
    }

    /// Lowest clear index below `len()`.
    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find_map(|(i, word)| {
                (*word != u64::MAX).then(|| i * WORD_BITS + word.trailing_ones() as usize)
            })
            .filter(|index| *index < self.len)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// True when every addressable bit is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Iterates set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let mut rest = *word;
            core::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }
}
