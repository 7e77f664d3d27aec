#![cfg(test)]

// Property tests for Directory kept inside the crate so they can use the
// unit-test object type and the internal invariant checks.

use crate::directory::Directory;
use crate::handle::RawHandle;
use crate::object::Managed;
use crate::testing::Node;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// Pool-indexed operations to improve shrinking: indices shrink to earlier
// slots and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Register(usize),
    Assign(usize),
    Remove(usize),
    Lookup(usize),
    LookupRaw(RawHandle),
    Filter(i64),
    Clear,
}

fn arb_scenario() -> impl Strategy<Value = (usize, Vec<OpI>)> {
    (1usize..=8).prop_flat_map(|slots| {
        let idx = 0..slots;
        let op = prop_oneof![
            3 => idx.clone().prop_map(OpI::Register),
            3 => idx.clone().prop_map(OpI::Assign),
            2 => idx.clone().prop_map(OpI::Remove),
            2 => idx.clone().prop_map(OpI::Lookup),
            1 => (0u64..16).prop_map(OpI::LookupRaw),
            1 => (0i64..100).prop_map(OpI::Filter),
            1 => Just(OpI::Clear),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (slots, ops))
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Fresh,
    Member,
}

struct Slot {
    node: Arc<Node>,
    status: Status,
}

impl Slot {
    fn fresh(value: i64) -> Self {
        Self {
            node: Node::new(value),
            status: Status::Fresh,
        }
    }
}

// Property: state-machine equivalence against a simple model.
// Invariants exercised across random operation sequences:
// - The handle map holds exactly the members that were given a handle, with
//   no duplicates and never the null handle.
// - `lookup_owned` resolves live handles to their object and nothing else.
// - Removed objects' handles stop resolving until they are issued again.
// - `filter` returns exactly the members matching the predicate.
// - `len`/`handle_count` parity with the model after each op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((slots, ops) in arb_scenario()) {
        let mut sut: Directory<Node> = Directory::new();
        let mut pool: Vec<Slot> = (0..slots as i64).map(Slot::fresh).collect();
        // handle -> pool index
        let mut live: BTreeMap<RawHandle, usize> = BTreeMap::new();
        let mut stale: BTreeSet<RawHandle> = BTreeSet::new();
        let mut next_value = slots as i64;

        for op in ops {
            match op {
                OpI::Register(i) => {
                    if pool[i].status == Status::Fresh {
                        sut.register(&pool[i].node);
                        pool[i].status = Status::Member;
                    }
                }
                OpI::Assign(i) => {
                    let slot = &pool[i];
                    if slot.status == Status::Member && !slot.node.link().is_public() {
                        let h = sut.assign_handle(&slot.node).get();
                        prop_assert!(h != 0);
                        prop_assert!(!live.contains_key(&h), "handle {} issued twice", h);
                        live.insert(h, i);
                        stale.remove(&h);
                    }
                }
                OpI::Remove(i) => {
                    if pool[i].status == Status::Member {
                        sut.remove(&pool[i].node);
                        if let Some(h) = pool[i].node.link().handle() {
                            prop_assert_eq!(live.remove(&h.get()), Some(i));
                            stale.insert(h.get());
                        }
                        pool[i] = Slot::fresh(next_value);
                        next_value += 1;
                    }
                }
                OpI::Lookup(i) => {
                    if let Some(h) = pool[i].node.link().handle() {
                        let found = sut.lookup_owned(h.get());
                        prop_assert!(found.is_some_and(|f| Arc::ptr_eq(&f, &pool[i].node)));
                    }
                }
                OpI::LookupRaw(raw) => {
                    let found = sut.lookup_owned(raw);
                    match live.get(&raw) {
                        Some(&i) => {
                            prop_assert!(found.is_some_and(|f| Arc::ptr_eq(&f, &pool[i].node)))
                        }
                        None => prop_assert!(found.is_none()),
                    }
                }
                OpI::Filter(threshold) => {
                    let got: BTreeSet<i64> = sut
                        .filter(|n| n.value() < threshold)
                        .iter()
                        .map(|n| n.value())
                        .collect();
                    let want: BTreeSet<i64> = pool
                        .iter()
                        .filter(|s| s.status == Status::Member)
                        .map(|s| s.node.value())
                        .filter(|v| *v < threshold)
                        .collect();
                    prop_assert_eq!(got, want);
                }
                OpI::Clear => {
                    sut.clear();
                    stale.extend(live.keys().copied());
                    live.clear();
                    for slot in pool.iter_mut() {
                        if slot.status == Status::Member {
                            // Removing a previous-generation object is a no-op.
                            sut.remove(&slot.node);
                            *slot = Slot::fresh(next_value);
                            next_value += 1;
                        }
                    }
                }
            }

            // Post-conditions after each op
            sut.check_invariants();
            for &h in &stale {
                prop_assert!(sut.lookup(h).is_none(), "stale handle {} resolves", h);
            }
            let members = pool.iter().filter(|s| s.status == Status::Member).count();
            prop_assert_eq!(sut.len(), members);
            prop_assert_eq!(sut.handle_count(), live.len());
            prop_assert!(sut.lookup(0).is_none());
        }
    }
}
