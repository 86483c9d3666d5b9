// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for registry and membership invariants
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only. Random operation sequences are replayed against a plain model.
//!
//! TEST_SCOPE:
//!   - Lowest-free slot allocation and reuse
//!   - The global domain and the master context survive kill requests
//!   - Capability bits never outlive membership
//!   - Membership and masks match the model after every step
//!
//! TEST_SCENARIOS:
//!   - registry_matches_model(): every step agrees with the model and keeps symmetry

use std::collections::BTreeMap;

use nexus_memview::{AddressSpace, Capability, Config, ContextId, DomainId};
use proptest::prelude::*;

const SLOTS: usize = 8;

#[derive(Clone, Debug)]
enum Op {
    CreateDomain,
    KillDomain(u32),
    CreateContext,
    KillContext(u32),
    Join(u32, u32),
    Leave(u32, u32),
    PrivAdd(u32, u32, u32),
    PrivDel(u32, u32, u32),
    PrivMod(u32, u32, u32),
}

fn op() -> impl Strategy<Value = Op> {
    let id = 0..SLOTS as u32;
    let mask = 0u32..16;
    prop_oneof![
        2 => Just(Op::CreateDomain),
        1 => id.clone().prop_map(Op::KillDomain),
        2 => Just(Op::CreateContext),
        1 => id.clone().prop_map(Op::KillContext),
        3 => (id.clone(), id.clone()).prop_map(|(d, c)| Op::Join(d, c)),
        2 => (id.clone(), id.clone()).prop_map(|(d, c)| Op::Leave(d, c)),
        3 => (id.clone(), id.clone(), mask.clone()).prop_map(|(d, c, m)| Op::PrivAdd(d, c, m)),
        2 => (id.clone(), id.clone(), mask.clone()).prop_map(|(d, c, m)| Op::PrivDel(d, c, m)),
        1 => (id.clone(), id, mask).prop_map(|(d, c, m)| Op::PrivMod(d, c, m)),
    ]
}

#[derive(Default)]
struct Model {
    domains: [bool; SLOTS],
    contexts: [bool; SLOTS],
    /// Joined pairs with their capability bits.
    members: BTreeMap<(u32, u32), u32>,
}

impl Model {
    fn enabled() -> Self {
        let mut model = Self::default();
        model.domains[0] = true;
        model.contexts[0] = true;
        model.members.insert((0, 0), Capability::all().bits());
        model
    }

    fn lowest_free(slots: &[bool; SLOTS]) -> Option<u32> {
        slots.iter().position(|live| !live).map(|index| index as u32)
    }

    fn pair_live(&self, d: u32, c: u32) -> bool {
        self.domains[d as usize] && self.contexts[c as usize]
    }

    fn member(&self, d: u32, c: u32) -> bool {
        self.pair_live(d, c) && self.members.contains_key(&(d, c))
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn registry_matches_model(ops in prop::collection::vec(op(), 1..80)) {
        let config = Config { max_domains: SLOTS, max_contexts: SLOTS, ..Config::default() };
        let space = AddressSpace::new(config).unwrap();
        let mut main = space.spawn_task();
        space.enable_isolation(&mut main).unwrap();
        let view = space.isolation().unwrap();
        let mut model = Model::enabled();

        for op in ops {
            match op {
                Op::CreateDomain => {
                    let expected = Model::lowest_free(&model.domains);
                    let got = view.domain_create().ok().map(DomainId::raw);
                    prop_assert_eq!(got, expected);
                    if let Some(d) = expected {
                        model.domains[d as usize] = true;
                    }
                }
                Op::KillDomain(d) => {
                    let killable = d != 0 && model.domains[d as usize];
                    prop_assert_eq!(view.domain_kill(DomainId::new(d)).is_ok(), killable);
                    if killable {
                        model.domains[d as usize] = false;
                        model.members.retain(|(md, _), _| *md != d);
                    }
                }
                Op::CreateContext => {
                    let expected = Model::lowest_free(&model.contexts);
                    let got = view.context_create().ok().map(ContextId::raw);
                    prop_assert_eq!(got, expected);
                    if let Some(c) = expected {
                        model.contexts[c as usize] = true;
                    }
                }
                Op::KillContext(c) => {
                    let killable = c != 0 && model.contexts[c as usize];
                    prop_assert_eq!(view.context_kill(ContextId::new(c)).is_ok(), killable);
                    if killable {
                        model.contexts[c as usize] = false;
                        model.members.retain(|(_, mc), _| *mc != c);
                    }
                }
                Op::Join(d, c) => {
                    let live = model.pair_live(d, c);
                    prop_assert_eq!(view.join(DomainId::new(d), ContextId::new(c)).is_ok(), live);
                    if live {
                        model.members.entry((d, c)).or_insert(0);
                    }
                }
                Op::Leave(d, c) => {
                    let member = model.member(d, c);
                    prop_assert_eq!(view.leave(DomainId::new(d), ContextId::new(c)).is_ok(), member);
                    model.members.remove(&(d, c));
                }
                Op::PrivAdd(d, c, m) | Op::PrivDel(d, c, m) | Op::PrivMod(d, c, m) => {
                    let member = model.member(d, c);
                    let caps = Capability::from_bits_truncate(m);
                    let (domain, context) = (DomainId::new(d), ContextId::new(c));
                    let result = match op {
                        Op::PrivAdd(..) => view.priv_add(domain, context, caps),
                        Op::PrivDel(..) => view.priv_del(domain, context, caps),
                        _ => view.priv_mod(domain, context, caps),
                    };
                    prop_assert_eq!(result.is_ok(), member);
                    if let Some(bits) = model.members.get_mut(&(d, c)).filter(|_| member) {
                        *bits = match op {
                            Op::PrivAdd(..) => *bits | m,
                            Op::PrivDel(..) => *bits & !m,
                            _ => m,
                        };
                    }
                }
            }

            prop_assert!(view.membership_violations().is_empty());
            for d in 0..SLOTS as u32 {
                for c in 0..SLOTS as u32 {
                    let (domain, context) = (DomainId::new(d), ContextId::new(c));
                    prop_assert_eq!(view.is_member(domain, context), model.member(d, c));
                    let expected = model
                        .members
                        .get(&(d, c))
                        .filter(|_| model.member(d, c))
                        .map(|bits| Capability::from_bits_truncate(*bits));
                    prop_assert_eq!(view.priv_get(domain, context).ok(), expected);
                }
            }
        }
    }
}
