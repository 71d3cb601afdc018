#![allow(missing_docs)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{adj, Harness};
use rowgraph::storage::{marker::edge_key, sortkey, ReverseMarker, StoreError};
use rowgraph::{
    AttrDef, DataKind, Graph, GraphConfig, GraphError, MemoryStore, ScalarValue, SlotState,
    TypeCatalog, TypeDef,
};

#[test]
fn attach_embeds_propagates_and_qualifies_marker() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);

    assert!(h.graph.attach_edge(child, parent, "Friends").is_empty());

    let row = h.adjacency(parent);
    assert_eq!(row.slots.xf(), &[SlotState::ChildUid]);
    assert_eq!(row.slots.nd(), &[child]);
    assert_eq!(row.live, 1);
    let names = h.store.row(parent, &sortkey::propagated(&adj(), "N")).unwrap();
    assert_eq!(names.values, vec![Some(ScalarValue::Str("cal".into()))]);
    let ages = h.store.row(parent, &sortkey::propagated(&adj(), "A")).unwrap();
    assert_eq!(ages.values, vec![Some(ScalarValue::Int(9))]);

    let raw = h.reverse(child).markers[&edge_key(parent, "F")].clone();
    let marker = ReverseMarker::decode(&raw).unwrap();
    assert!(marker.qualified);
    assert_eq!(marker.target, parent);
    assert_eq!(marker.batch, 0);
}

#[test]
fn reattach_is_rejected_without_new_slot() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);
    assert!(h.graph.attach_edge(child, parent, "Friends").is_empty());
    let before = h.adjacency(parent);

    let errors = h.graph.attach_edge(child, parent, "Friends");
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], GraphError::EdgeAlreadyExists { .. }));
    assert_eq!(h.adjacency(parent), before);
    assert_eq!(h.metrics.gatekeeper_rejections.load(Ordering::Relaxed), 1);
}

#[test]
fn concurrent_duplicate_attach_lands_once() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let graph = Arc::clone(&h.graph);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                graph.attach_edge(child, parent, "Friends")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|errors| errors.is_empty()).count(), 1);
    for errors in results.iter().filter(|errors| !errors.is_empty()) {
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_gatekeeper_rejection());
    }
    let row = h.adjacency(parent);
    assert_eq!(row.slots.len(), 1);
    assert_eq!(row.live, 1);
}

#[test]
fn detach_of_unattached_edge_writes_nothing() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);
    let writes = h.store.stats().writes;

    let err = h.graph.detach_edge(child, parent, "Friends").unwrap_err();
    assert!(matches!(err, GraphError::EdgeNotAttached { .. }));
    assert_eq!(h.store.stats().writes, writes);
}

#[test]
fn detach_soft_deletes_and_keeps_scalars() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let ann = h.person("ann", 30);
    let bob = h.person("bob", 31);
    assert!(h.graph.attach_edge(ann, parent, "Friends").is_empty());
    assert!(h.graph.attach_edge(bob, parent, "Friends").is_empty());

    h.graph.detach_edge(ann, parent, "Friends").unwrap();
    let row = h.adjacency(parent);
    assert_eq!(row.slots.xf(), &[SlotState::UidDetached, SlotState::ChildUid]);
    assert_eq!(row.live, 1);
    let names = h.store.row(parent, &sortkey::propagated(&adj(), "N")).unwrap();
    assert_eq!(names.values.len(), 2);
    assert!(h.reverse(ann).markers.is_empty());

    let view = h.graph.children(parent, "Friends").unwrap();
    assert_eq!(view.children(), vec![bob]);
    assert!(matches!(
        h.graph.detach_edge(ann, parent, "Friends"),
        Err(GraphError::EdgeNotAttached { .. })
    ));
}

#[test]
fn propagated_lists_stay_aligned() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..12).map(|i| h.person(&format!("k{i}"), i)).collect();
    for kid in &kids {
        assert!(h.graph.attach_edge(*kid, parent, "Friends").is_empty());
    }
    h.graph.detach_edge(kids[3], parent, "Friends").unwrap();

    let row = h.adjacency(parent);
    for short in ["N", "A"] {
        let list = h.store.row(parent, &sortkey::propagated(&adj(), short)).unwrap();
        assert_eq!(list.values.len(), row.slots.len());
    }
    let view = h.graph.children(parent, "Friends").unwrap();
    assert_eq!(view.len(), 11);
    for edge in view.edges() {
        let idx = kids.iter().position(|kid| *kid == edge.child).unwrap();
        assert_eq!(edge.scalar("Age"), Some(&ScalarValue::Int(idx as i64)));
    }
}

#[test]
fn failed_propagation_leaves_edge_attachable() {
    let store = MemoryStore::new();
    let h = Harness::with_store(store, GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);
    h.store.inject_fault(
        Some(parent),
        sortkey::propagated(&adj(), "N").as_str(),
        StoreError::Backend("disk on fire".into()),
        1,
    );

    let errors = h.graph.attach_edge(child, parent, "Friends");
    assert_eq!(errors, vec![GraphError::Storage("disk on fire".into())]);
    assert!(h.reverse(child).markers.is_empty());
    assert_eq!(h.adjacency(parent).live, 0);
    assert!(h.graph.children(parent, "Friends").unwrap().is_empty());

    assert!(h.graph.attach_edge(child, parent, "Friends").is_empty());
    assert_eq!(h.graph.children(parent, "Friends").unwrap().children(), vec![child]);
}

#[test]
fn configuration_errors_surface_immediately() {
    let h = Harness::new(GraphConfig::default());
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);

    let errors = h.graph.attach_edge(child, parent, "Enemies");
    assert!(matches!(errors.as_slice(), [GraphError::AttributeNotFound { .. }]));
    let stray = rowgraph::Uid::generate();
    let errors = h.graph.attach_edge(child, stray, "Friends");
    assert_eq!(errors, vec![GraphError::NoTypeDefined(stray)]);
    assert!(h.reverse(child).markers.is_empty());
}

#[test]
fn detach_blocked_on_overflow_row_keeps_edge_attached() {
    let config = GraphConfig::default()
        .embedded_threshold(1)
        .with_lock_timeout(Duration::from_millis(30));
    let h = Harness::new(config);
    let parent = h.person("pat", 40);
    let first = h.person("fay", 20);
    let child = h.person("cal", 9);
    assert!(h.graph.attach_edge(first, parent, "Friends").is_empty());
    assert!(h.graph.attach_edge(child, parent, "Friends").is_empty());
    let ouid = h
        .adjacency(parent)
        .slots
        .iter()
        .find(|slot| slot.state.is_overflow())
        .map(|slot| slot.uid)
        .unwrap();

    let holder = h
        .graph
        .fetch_for_update(ouid, &sortkey::overflow_prefix(&adj()))
        .unwrap();
    let graph = Arc::clone(&h.graph);
    let outcome = thread::spawn(move || graph.detach_edge(child, parent, "Friends"))
        .join()
        .unwrap();
    assert_eq!(outcome, Err(GraphError::LockTimeout(ouid)));
    drop(holder);

    let raw = h.reverse(child).markers[&edge_key(parent, "F")].clone();
    let marker = ReverseMarker::decode(&raw).unwrap();
    assert!(marker.qualified);
    assert_eq!(marker.target, ouid);
    let errors = h.graph.attach_edge(child, parent, "Friends");
    assert!(matches!(errors.as_slice(), [GraphError::EdgeAlreadyExists { .. }]));
    assert_eq!(
        h.graph.children(parent, "Friends").unwrap().children(),
        vec![first, child]
    );

    h.graph.detach_edge(child, parent, "Friends").unwrap();
    assert_eq!(h.graph.children(parent, "Friends").unwrap().children(), vec![first]);
}

#[test]
fn failed_settle_reverts_reservation_and_marker() {
    let catalog = TypeCatalog::new()
        .with_type(
            TypeDef::new("Tag", "T")
                .attr(AttrDef::scalar("Label", "L", DataKind::String))
                .attr(AttrDef::uid_pred("Links", "K", "Tag")),
        )
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let graph = Graph::new(store.clone(), catalog, GraphConfig::default());
    let parent = graph.create_node("Tag", &[]).unwrap();
    let child = graph.create_node("Tag", &[]).unwrap();
    let links = sortkey::adjacency("A", "K");
    store.inject_fault(
        Some(parent),
        links.as_str(),
        StoreError::Backend("lost".into()),
        1,
    );

    let errors = graph.attach_edge(child, parent, "Links");
    assert_eq!(errors, vec![GraphError::Storage("lost".into())]);
    let row = store.row(parent, &links).unwrap();
    assert_eq!(row.slots.xf(), &[SlotState::UidDetached]);
    assert_eq!(row.live, 0);
    let reverse = store.row(child, &sortkey::reverse_row()).unwrap_or_default();
    assert!(reverse.markers.is_empty());

    assert!(graph.attach_edge(child, parent, "Links").is_empty());
    let row = store.row(parent, &links).unwrap();
    assert_eq!(row.slots.xf(), &[SlotState::UidDetached, SlotState::ChildUid]);
    graph.detach_edge(child, parent, "Links").unwrap();
    assert!(graph.children(parent, "Links").unwrap().is_empty());
}

#[test]
fn attach_gives_up_while_child_stays_locked() {
    let config = GraphConfig::default().with_lock_timeout(Duration::from_millis(30));
    let h = Harness::new(config);
    let parent = h.person("pat", 40);
    let child = h.person("cal", 9);

    let holder = h.graph.fetch_for_update(child, "A#").unwrap();
    let graph = Arc::clone(&h.graph);
    let errors = thread::spawn(move || graph.attach_edge(child, parent, "Friends"))
        .join()
        .unwrap();
    assert_eq!(errors, vec![GraphError::LockTimeout(child)]);
    drop(holder);

    assert!(h.reverse(child).markers.is_empty());
    assert!(h.graph.attach_edge(child, parent, "Friends").is_empty());
}
