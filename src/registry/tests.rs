//! Unit tests for the node instance registry.

use std::sync::Barrier;
use std::thread;

use super::*;
use crate::test_support::FailingStore;
use rstest::{fixture, rstest};

#[fixture]
fn registry() -> NodeInstanceRegistry<MemoryStore> {
    NodeInstanceRegistry::open(MemoryStore::new()).expect("empty store should open")
}

fn set(nodes: &[&str]) -> BTreeSet<String> {
    nodes.iter().map(|node| (*node).to_owned()).collect()
}

#[rstest]
fn put_is_idempotent(registry: NodeInstanceRegistry<MemoryStore>) {
    assert!(registry.put("i1", "n1").expect("first put"));
    assert!(!registry.put("i1", "n1").expect("repeated put"));

    assert_eq!(registry.nodes_of("i1"), set(&["n1"]));
    assert_eq!(registry.store().records().get("i1"), Some(&set(&["n1"])));
}

#[rstest]
fn put_rejects_node_owned_by_another_instance(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.put("i1", "n1").expect("first put");

    let err = registry.put("i2", "n1").expect_err("duplicate should fail");

    let RegistryError::DuplicateNode {
        node,
        owner,
        requested,
    } = err
    else {
        panic!("expected DuplicateNode, got {err:?}");
    };
    assert_eq!((node.as_str(), owner.as_str()), ("n1", "i1"));
    assert_eq!(requested, "i2");
    assert!(registry.nodes_of("i2").is_empty());
    assert_eq!(registry.instance_of("n1").as_deref(), Some("i1"));
}

#[rstest]
fn removing_last_node_empties_and_retires_instance(
    registry: NodeInstanceRegistry<MemoryStore>,
) {
    registry.put("i1", "n1").expect("put");

    let removal = registry.remove("n1").expect("remove");

    assert_eq!(
        removal,
        Removal {
            instance_id: String::from("i1"),
            remaining: 0
        }
    );
    assert!(removal.emptied_instance());
    assert!(registry.is_empty("i1"));
    assert!(registry.is_retired("i1").expect("retired lookup"));
    assert!(registry.store().records().is_empty());
    assert!(registry.snapshot().is_empty());
}

#[rstest]
fn second_remove_of_same_node_is_unknown(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.put("i1", "n1").expect("put");
    registry.remove("n1").expect("first remove");

    let err = registry.remove("n1").expect_err("second remove should fail");
    assert!(matches!(err, RegistryError::UnknownNode { node } if node == "n1"));
}

#[rstest]
fn removal_keeps_siblings(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.put("i1", "n1").expect("put n1");
    registry.put("i1", "n2").expect("put n2");

    let removal = registry.remove("n1").expect("remove");

    assert_eq!(removal.remaining, 1);
    assert!(!registry.is_empty("i1"));
    assert_eq!(registry.store().records().get("i1"), Some(&set(&["n2"])));
}

#[rstest]
fn late_registration_on_retired_instance_is_rejected(
    registry: NodeInstanceRegistry<MemoryStore>,
) {
    registry.put("i1", "n1").expect("put");
    registry.remove("n1").expect("remove");

    let err = registry.put("i1", "n2").expect_err("retired instance should reject");

    assert!(matches!(err, RegistryError::InstanceRetired { instance_id } if instance_id == "i1"));
    assert_eq!(registry.instance_of("n2"), None);
}

#[rstest]
fn retired_instance_is_dropped_from_memory(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.put("i1", "n1").expect("put");
    registry.track_instance("pending").expect("track");
    registry.remove("n1").expect("remove");
    registry.retire_instance("pending").expect("retire");

    let late = registry.put("i1", "n2").expect_err("retired instance should reject");
    let retrack = registry
        .track_instance("pending")
        .expect_err("retired instance should not be tracked again");

    assert!(matches!(late, RegistryError::InstanceRetired { .. }));
    assert!(matches!(retrack, RegistryError::InstanceRetired { .. }));
    assert!(read(&registry.slots).is_empty());
    assert!(!registry.retire_instance("i1").expect("retire again"));
}

#[test]
fn reopened_registry_rejects_retired_instance() {
    let store = MemoryStore::new();
    let first = NodeInstanceRegistry::open(store.clone()).expect("open");
    first.put("i1", "n1").expect("put");
    first.remove("n1").expect("remove");
    drop(first);

    let second = NodeInstanceRegistry::open(store).expect("reopen");

    assert!(second.is_retired("i1").expect("retired lookup"));
    assert!(matches!(
        second.put("i1", "n2"),
        Err(RegistryError::InstanceRetired { .. })
    ));
    assert_eq!(second.instance_of("n2"), None);
    assert!(second.snapshot().is_empty());
}

#[rstest]
fn unknown_instance_is_empty(registry: NodeInstanceRegistry<MemoryStore>) {
    assert!(registry.is_empty("never-seen"));
    assert!(registry.nodes_of("never-seen").is_empty());
}

#[rstest]
fn tracked_instance_is_pending_and_persisted(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.track_instance("i1").expect("track");
    registry.track_instance("i1").expect("track twice");

    assert!(registry.is_empty("i1"));
    assert_eq!(registry.snapshot().get("i1"), Some(&BTreeSet::new()));
    assert_eq!(registry.store().records().get("i1"), Some(&BTreeSet::new()));
}

#[rstest]
fn retire_instance_only_accepts_pending_instances(registry: NodeInstanceRegistry<MemoryStore>) {
    registry.track_instance("pending").expect("track");
    registry.put("busy", "n1").expect("put");

    assert!(registry.retire_instance("pending").expect("retire"));
    assert!(!registry.retire_instance("pending").expect("retire again"));
    assert!(matches!(
        registry.retire_instance("busy"),
        Err(RegistryError::InstanceInUse { nodes: 1, .. })
    ));
    assert!(matches!(
        registry.retire_instance("ghost"),
        Err(RegistryError::UnknownInstance { .. })
    ));
    assert!(!registry.store().records().contains_key("pending"));
}

#[test]
fn store_failure_leaves_state_unchanged() {
    let store = FailingStore::new();
    let registry = NodeInstanceRegistry::open(store.clone()).expect("open");
    registry.put("i1", "n1").expect("put");

    store.fail_writes(true);
    let put_err = registry.put("i1", "n2").expect_err("save should fail");
    let remove_err = registry.remove("n1").expect_err("retire should fail");

    assert!(matches!(put_err, RegistryError::Store(_)));
    assert!(matches!(remove_err, RegistryError::Store(_)));
    assert_eq!(registry.nodes_of("i1"), set(&["n1"]));
    assert_eq!(registry.instance_of("n2"), None);
    assert_eq!(registry.instance_of("n1").as_deref(), Some("i1"));

    store.fail_writes(false);
    registry.put("i2", "n2").expect("n2 is free after the failed put");
}

#[test]
fn reopening_restores_mapping() {
    let store = MemoryStore::new();
    let first = NodeInstanceRegistry::open(store.clone()).expect("open");
    first.put("i1", "n1").expect("put");
    first.put("i1", "n2").expect("put");
    first.put("i2", "n3").expect("put");
    first.track_instance("i3").expect("track");
    first.remove("n2").expect("remove");
    let before = first.snapshot();
    drop(first);

    let second = NodeInstanceRegistry::open(store).expect("reopen");

    assert_eq!(second.snapshot(), before);
    assert_eq!(second.instance_of("n3").as_deref(), Some("i2"));
}

#[test]
fn conflicting_records_are_rejected_on_open() {
    let mut records = InstanceRecords::new();
    records.insert(String::from("i1"), set(&["n1"]));
    records.insert(String::from("i2"), set(&["n1"]));

    let err = NodeInstanceRegistry::open(MemoryStore::with_records(records))
        .expect_err("conflict should fail");
    assert!(matches!(err, RegistryError::Conflict { node, .. } if node == "n1"));
}

#[test]
fn concurrent_removals_empty_an_instance_exactly_once() {
    const NODES: usize = 8;
    for _ in 0..50 {
        let registry = NodeInstanceRegistry::open(MemoryStore::new()).expect("open");
        for index in 0..NODES {
            registry.put("i1", &format!("n{index}")).expect("put");
        }
        let barrier = Barrier::new(NODES);

        let emptied = thread::scope(|scope| {
            let handles: Vec<_> = (0..NODES)
                .map(|index| {
                    let registry_ref = &registry;
                    let barrier_ref = &barrier;
                    scope.spawn(move || {
                        barrier_ref.wait();
                        registry_ref
                            .remove(&format!("n{index}"))
                            .expect("remove")
                            .emptied_instance()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread should not panic"))
                .filter(|emptied| *emptied)
                .count()
        });

        assert_eq!(emptied, 1);
        assert!(registry.is_empty("i1"));
    }
}

#[test]
fn concurrent_puts_of_one_node_have_a_single_owner() {
    let registry = NodeInstanceRegistry::open(MemoryStore::new()).expect("open");
    let instances = ["i1", "i2", "i3", "i4"];
    let barrier = Barrier::new(instances.len());

    let accepted = thread::scope(|scope| {
        let handles: Vec<_> = instances
            .iter()
            .map(|instance| {
                let registry_ref = &registry;
                let barrier_ref = &barrier;
                scope.spawn(move || {
                    barrier_ref.wait();
                    registry_ref.put(instance, "shared").is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should not panic"))
            .filter(|ok| *ok)
            .count()
    });

    assert_eq!(accepted, 1);
    let owner = registry.instance_of("shared").expect("node should be owned");
    let holders = registry
        .snapshot()
        .into_iter()
        .filter(|(_, nodes)| nodes.contains("shared"))
        .map(|(instance, _)| instance)
        .collect::<Vec<_>>();
    assert_eq!(holders, vec![owner]);
}
