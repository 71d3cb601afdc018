#![allow(missing_docs)]

mod common;

use std::sync::atomic::Ordering;

use common::{adj, Harness};
use proptest::prelude::*;
use rowgraph::storage::{marker::edge_key, sortkey, ReverseMarker, StoreError};
use rowgraph::{GraphConfig, SlotState, Uid};

fn marker_of(h: &Harness, child: Uid, parent: Uid) -> ReverseMarker {
    let raw = h.reverse(child).markers[&edge_key(parent, "F")].clone();
    ReverseMarker::decode(&raw).unwrap()
}

/// Asserts that every row holding child slots for `parent` keeps its
/// propagated lists as long as its slot sequence.
fn assert_aligned(h: &Harness, parent: Uid) {
    let row = h.adjacency(parent);
    let embedded = row.slots.iter().filter(|s| s.state.is_embedded()).count();
    for short in ["N", "A"] {
        let len = h
            .store
            .row(parent, &sortkey::propagated(&adj(), short))
            .map_or(0, |list| list.values.len());
        assert_eq!(len, embedded, "parent list {short}");
    }
    for pointer in row.slots.iter().filter(|s| s.state.is_overflow()) {
        for batch in 0..=pointer.batch {
            let key = sortkey::overflow_batch(&adj(), batch);
            let Some(batch_row) = h.store.row(pointer.uid, &key) else {
                continue;
            };
            for short in ["N", "A"] {
                let len = h
                    .store
                    .row(pointer.uid, &sortkey::propagated(&key, short))
                    .map_or(0, |list| list.values.len());
                assert_eq!(len, batch_row.slots.len(), "overflow list {short} batch {batch}");
            }
        }
    }
}

#[test]
fn third_child_spills_into_new_overflow_row() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(2));
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..3).map(|i| h.person(&format!("k{i}"), i)).collect();
    for kid in &kids {
        assert!(h.graph.attach_edge(*kid, parent, "Friends").is_empty());
    }

    let row = h.adjacency(parent);
    assert_eq!(
        row.slots.xf(),
        &[SlotState::ChildUid, SlotState::ChildUid, SlotState::OvflBlockUid]
    );
    assert_eq!(&row.slots.nd()[..2], &kids[..2]);
    let overflow = row.slots.nd()[2];

    let marker = marker_of(&h, kids[2], parent);
    assert_eq!(marker.target, overflow);
    assert_eq!(marker.batch, 0);
    let batch = h.store.row(overflow, &sortkey::overflow_batch(&adj(), 0)).unwrap();
    assert_eq!(batch.slots.nd(), &[kids[2]]);
    assert_eq!(batch.slots.xf(), &[SlotState::ChildUid]);
    assert_eq!(batch.live, 1);
    assert_eq!(h.metrics.overflow_rows_created.load(Ordering::Relaxed), 1);
    assert_aligned(&h, parent);
}

#[test]
fn full_overflow_pointer_is_replaced_transparently() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(1));
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..3).map(|i| h.person(&format!("k{i}"), i)).collect();
    assert!(h.graph.attach_edge(kids[0], parent, "Friends").is_empty());
    assert!(h.graph.attach_edge(kids[1], parent, "Friends").is_empty());
    let first = h.adjacency(parent).slots.nd()[1];

    h.store
        .inject_fault(Some(first), &sortkey::overflow_prefix(&adj()), StoreError::ItemTooLarge, 1);
    assert!(h.graph.attach_edge(kids[2], parent, "Friends").is_empty());

    let row = h.adjacency(parent);
    assert_eq!(
        row.slots.xf(),
        &[SlotState::ChildUid, SlotState::OvflItemFull, SlotState::OvflBlockUid]
    );
    assert_eq!(row.slots.nd()[1], first);
    let second = row.slots.nd()[2];
    assert_eq!(marker_of(&h, kids[2], parent).target, second);
    assert!(h.store.row(first, &sortkey::overflow_batch(&adj(), 0)).unwrap().full);
    assert_eq!(h.graph.children(parent, "Friends").unwrap().children(), kids);
    assert_aligned(&h, parent);
}

#[test]
fn overflow_rows_stay_bounded_and_batches_reopen() {
    let config = GraphConfig::default()
        .embedded_threshold(2)
        .max_overflow(2)
        .overflow_batch_limit(3);
    let h = Harness::new(config);
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..10).map(|i| h.person(&format!("k{i}"), i)).collect();
    for (idx, kid) in kids.iter().enumerate() {
        assert!(h.graph.attach_edge(*kid, parent, "Friends").is_empty(), "child {idx}");
        let row = h.adjacency(parent);
        assert!(row.slots.iter().filter(|s| s.state.is_overflow()).count() <= 2);
        if idx >= 2 {
            assert_ne!(marker_of(&h, *kid, parent).target, parent);
        }
    }

    let row = h.adjacency(parent);
    let pointers: Vec<_> = row.slots.iter().filter(|s| s.state.is_overflow()).collect();
    assert_eq!(pointers.len(), 2);
    assert_eq!(marker_of(&h, kids[8], parent).batch, 1);
    assert_eq!(h.metrics.overflow_rows_created.load(Ordering::Relaxed), 2);
    assert_eq!(h.metrics.batches_reopened.load(Ordering::Relaxed), 2);

    let view = h.graph.children(parent, "Friends").unwrap();
    let mut seen = view.children();
    let mut expected = kids.clone();
    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);
    assert_aligned(&h, parent);
}

#[test]
fn detach_finds_slot_in_overflow_batch() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(1));
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..3).map(|i| h.person(&format!("k{i}"), i)).collect();
    for kid in &kids {
        assert!(h.graph.attach_edge(*kid, parent, "Friends").is_empty());
    }
    let target = marker_of(&h, kids[1], parent).target;

    h.graph.detach_edge(kids[1], parent, "Friends").unwrap();
    let batch = h.store.row(target, &sortkey::overflow_batch(&adj(), 0)).unwrap();
    assert_eq!(batch.slots.xf(), &[SlotState::UidDetached, SlotState::ChildUid]);
    assert_eq!(batch.live, 1);
    assert_eq!(h.graph.children(parent, "Friends").unwrap().children(), vec![kids[0], kids[2]]);
}

#[test]
fn full_list_during_propagation_moves_attach_to_new_row() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(1));
    let parent = h.person("pat", 40);
    let kids: Vec<_> = (0..4).map(|i| h.person(&format!("k{i}"), i)).collect();
    assert!(h.graph.attach_edge(kids[0], parent, "Friends").is_empty());
    assert!(h.graph.attach_edge(kids[1], parent, "Friends").is_empty());
    let first = h.adjacency(parent).slots.nd()[1];
    let names = sortkey::propagated(&sortkey::overflow_batch(&adj(), 0), "N");
    h.store
        .inject_fault(Some(first), names.as_str(), StoreError::ItemTooLarge, 1);

    assert!(h.graph.attach_edge(kids[2], parent, "Friends").is_empty());
    assert!(h.graph.attach_edge(kids[3], parent, "Friends").is_empty());

    let retired = h.store.row(first, &sortkey::overflow_batch(&adj(), 0)).unwrap();
    assert!(retired.full);
    assert_eq!(retired.slots.xf(), &[SlotState::ChildUid, SlotState::UidDetached]);
    let row = h.adjacency(parent);
    assert_eq!(row.slots.xf()[1], SlotState::OvflItemFull);
    assert_ne!(marker_of(&h, kids[2], parent).target, first);
    assert_eq!(h.metrics.attach_retries.load(Ordering::Relaxed), 1);
    assert_eq!(h.graph.children(parent, "Friends").unwrap().children(), kids);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn slot_rows_stay_consistent(
        threshold in 1usize..4,
        max_overflow in 1usize..4,
        batch_limit in 1usize..4,
        children in 1usize..14,
    ) {
        let config = GraphConfig::default()
            .embedded_threshold(threshold)
            .max_overflow(max_overflow)
            .overflow_batch_limit(batch_limit);
        let h = Harness::new(config);
        let parent = h.person("pat", 40);
        let mut attached = 0usize;
        for i in 0..children {
            let kid = h.person(&format!("k{i}"), i as i64);
            if h.graph.attach_edge(kid, parent, "Friends").is_empty() {
                attached += 1;
            }
        }
        let row = h.adjacency(parent);
        prop_assert_eq!(row.slots.nd().len(), row.slots.xf().len());
        prop_assert_eq!(row.slots.xf().len(), row.slots.id().len());
        prop_assert!(row.slots.iter().filter(|s| s.state.is_overflow()).count() <= max_overflow);
        prop_assert!(row.slots.iter().all(|s| s.state != SlotState::CuidInUse && s.state != SlotState::OuidInUse));
        prop_assert_eq!(h.graph.children(parent, "Friends").unwrap().len(), attached);
        assert_aligned(&h, parent);
    }
}
