// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry lifecycle scenarios for domains, contexts and capabilities
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 8 integration tests
//!
//! TEST_SCOPE:
//!   - Capability grant/revoke through the public registry API
//!   - Slot exhaustion and reuse of the lowest free slot
//!   - Domain kill with several members
//!   - Repeated teardown of an empty address space
//!
//! TEST_SCENARIOS:
//!   - test_grant_then_revoke_write(): READ|WRITE granted, WRITE revoked, READ remains
//!   - test_full_domain_table(): 1024 slots fill, the next create fails, a killed slot is reused
//!   - test_kill_domain_with_two_members(): both members are evicted and the slot is reusable
//!   - test_created_ids_are_distinct_and_in_range(): no duplicate ids without a kill
//!   - test_create_after_kill_returns_lowest_free(): reuse prefers the lowest free slot;
//!     the global domain cannot be killed
//!   - test_teardown_twice_is_noop(): free-all on an empty model stays empty and silent
//!   - test_operations_before_enable(): every registry call fails with NotEnabled
//!   - test_command_session(): a scripted session through the text protocol
//!
//! DEPENDENCIES:
//!   - nexus_memview::AddressSpace: address space owning the isolation state

use std::collections::HashSet;

use nexus_memview::{
    AddressSpace, Capability, Config, ContextId, DomainId, Error, SlotKind, GLOBAL_DOMAIN,
};

fn isolated(config: Config) -> AddressSpace {
    let space = AddressSpace::new(config).unwrap();
    let mut main = space.spawn_task();
    space.enable_isolation(&mut main).unwrap();
    space
}

#[test]
fn grant_then_revoke_write() {
    let space = isolated(Config::default());
    let view = space.isolation().unwrap();
    let d0 = view.domain_create().unwrap();
    let c0 = view.context_create().unwrap();
    view.join(d0, c0).unwrap();
    view.priv_add(d0, c0, Capability::READ | Capability::WRITE).unwrap();
    assert_eq!(view.priv_get(d0, c0), Ok(Capability::READ | Capability::WRITE));
    view.priv_del(d0, c0, Capability::WRITE).unwrap();
    assert_eq!(view.priv_get(d0, c0), Ok(Capability::READ));
}

#[test]
fn full_domain_table() {
    let space = isolated(Config::default());
    let view = space.isolation().unwrap();
    assert_eq!(view.domain_count(), 1);
    for expected in 1..1024u32 {
        assert_eq!(view.domain_create(), Ok(DomainId::new(expected)));
    }
    assert_eq!(view.domain_count(), 1024);
    assert_eq!(view.domain_create(), Err(Error::OutOfSlots(SlotKind::Domain)));

    let victim = DomainId::new(517);
    view.domain_kill(victim).unwrap();
    assert_eq!(view.domain_create(), Ok(victim));
    assert_eq!(view.domain_create(), Err(Error::OutOfSlots(SlotKind::Domain)));

    let mut main = space.spawn_task();
    assert_eq!(space.execute(&mut main, "domain,create"), -1);
}

#[test]
fn kill_domain_with_two_members() {
    let space = isolated(Config::default());
    let view = space.isolation().unwrap();
    let d1 = view.domain_create().unwrap();
    let c1 = view.context_create().unwrap();
    let c2 = view.context_create().unwrap();
    view.join(d1, c1).unwrap();
    view.join(d1, c2).unwrap();
    view.priv_add(d1, c1, Capability::READ).unwrap();
    view.priv_add(d1, c2, Capability::all()).unwrap();

    view.domain_kill(d1).unwrap();
    assert!(!view.is_member(d1, c1));
    assert!(!view.is_member(d1, c2));
    assert!(!view.domain_exists(d1));
    assert!(view.context_exists(c1));
    assert!(view.context_exists(c2));
    assert!(view.membership_violations().is_empty());

    assert_eq!(view.domain_create(), Ok(d1));
    assert_eq!(view.priv_get(d1, c2), Err(Error::NotAMember { domain: d1, context: c2 }));
}

#[test]
fn created_ids_are_distinct_and_in_range() {
    let config = Config { max_domains: 64, max_contexts: 64, ..Config::default() };
    let space = isolated(config);
    let view = space.isolation().unwrap();

    let domains: Vec<_> = std::iter::from_fn(|| view.domain_create().ok()).collect();
    let contexts: Vec<_> = std::iter::from_fn(|| view.context_create().ok()).collect();
    assert_eq!(domains.len(), 63);
    assert_eq!(contexts.len(), 63);

    let unique: HashSet<_> = domains.iter().map(|id| id.raw()).collect();
    assert_eq!(unique.len(), domains.len());
    assert!(domains.iter().all(|id| id.raw() < 64 && *id != GLOBAL_DOMAIN));
    let unique: HashSet<_> = contexts.iter().map(|id| id.raw()).collect();
    assert_eq!(unique.len(), contexts.len());
    assert!(contexts.iter().all(|id| id.raw() < 64 && !id.is_master()));
}

#[test]
fn create_after_kill_returns_lowest_free() {
    let space = isolated(Config::default());
    let view = space.isolation().unwrap();
    let ids: Vec<_> = (0..6).map(|_| view.context_create().unwrap()).collect();
    assert_eq!(ids[0], ContextId::new(1));

    view.context_kill(ids[4]).unwrap();
    view.context_kill(ids[2]).unwrap();
    assert_eq!(view.context_create(), Ok(ids[2]));
    assert_eq!(view.context_create(), Ok(ids[4]));
    assert_eq!(view.context_create(), Ok(ContextId::new(7)));

    assert_eq!(view.domain_kill(GLOBAL_DOMAIN), Err(Error::GlobalDomain));
    assert_eq!(view.global_domain(), Ok(GLOBAL_DOMAIN));
    assert_eq!(view.domain_create(), Ok(DomainId::new(1)));
}

#[test]
fn teardown_twice_is_noop() {
    let space = isolated(Config::default());
    let view = space.isolation().unwrap();
    for _ in 0..4 {
        let d = view.domain_create().unwrap();
        let c = view.context_create().unwrap();
        view.join(d, c).unwrap();
    }

    view.teardown();
    assert_eq!(view.domain_count(), 0);
    assert_eq!(view.context_count(), 0);
    view.teardown();
    view.teardown();
    assert_eq!(view.domain_count(), 0);
    assert_eq!(view.context_count(), 0);
    view.domain_free_all();
    view.context_free_all();
    assert_eq!(view.domain_count(), 0);
}

#[test]
fn operations_before_enable() {
    let space = AddressSpace::new(Config::default()).unwrap();
    let mut task = space.spawn_task();
    assert!(!space.is_isolated());
    assert_eq!(space.global_domain(), Err(Error::NotEnabled));
    assert_eq!(space.current_context(&task), Err(Error::NotEnabled));
    assert_eq!(space.mmap_register(&mut task, GLOBAL_DOMAIN), Err(Error::NotEnabled));
    assert_eq!(space.execute(&mut task, "context,create"), -1);
    assert_eq!(space.execute(&mut task, "context,getid"), -1);
}

#[test]
fn command_session() {
    let space = AddressSpace::new(Config::default()).unwrap();
    let mut main = space.spawn_task();
    let script = [
        ("context,maininit", 0),
        ("context,maininit", -1),
        ("domain,create", 1),
        ("domain,create", 2),
        ("context,create", 1),
        ("context,domain,1,join,2", 0),
        ("context,domain,1,leave,2", 0),
        ("context,domain,1,leave,2", -1),
        ("context,domain,1,join,1", 0),
        ("domain,priv,1,1,add,0xf", 0),
        ("domain,priv,1,1,del,0x2", 0),
        ("domain,priv,1,1,get", 13),
        ("domain,priv,0,0,get", 15),
        ("domain,mmapregister,9", -1),
        ("domain,mmapregister,2", 0),
        ("context,exists,1", 1),
        ("context,exists,1024", 0),
        ("context,kill,0", -1),
        ("domain,kill,2", 0),
        ("domain,kill,2", -1),
    ];
    for (line, expected) in script {
        assert_eq!(space.execute(&mut main, line), expected, "{line}");
    }
}
