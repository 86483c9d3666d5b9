// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for capability bitmaps
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only. Ensures grant/revoke behave as independent per-context bit sets.
//!
//! TEST_SCOPE:
//!   - Grant/revoke arithmetic matches Capability set operations
//!   - Operations on one context never leak into another
//!
//! TEST_SCENARIOS:
//!   - grant_revoke_matches_set_algebra(): final mask equals (a | b) & !c
//!   - contexts_are_independent(): touching context x leaves context y unchanged

use super::{Capability, CapabilityTable};
use crate::types::ContextId;
use proptest::prelude::*;

fn arb_caps() -> impl Strategy<Value = Capability> {
    (0u32..16).prop_map(Capability::from_bits_truncate)
}

proptest! {
    #[test]
    fn grant_revoke_matches_set_algebra(ctx in 0u32..128, a in arb_caps(), b in arb_caps(), c in arb_caps()) {
        let mut table = CapabilityTable::new(128);
        let id = ContextId::new(ctx);
        table.grant(id, a);
        table.grant(id, b);
        table.revoke(id, c);
        prop_assert_eq!(table.get(id), (a | b) & !c);
        prop_assert_eq!(table.holds_any(id), !((a | b) & !c).is_empty());
    }

    #[test]
    fn contexts_are_independent(x in 0u32..64, y in 0u32..64, base in arb_caps(), change in arb_caps()) {
        prop_assume!(x != y);
        let mut table = CapabilityTable::new(64);
        table.grant(ContextId::new(y), base);
        table.grant(ContextId::new(x), change);
        table.revoke(ContextId::new(x), Capability::all());
        prop_assert_eq!(table.get(ContextId::new(y)), base);
        prop_assert!(table.get(ContextId::new(x)).is_empty());
    }
}
