#![allow(missing_docs)]

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::Harness;
use rowgraph::{EdgeRequest, GraphConfig, GraphError, SlotState, Throttle, Uid};

fn sorted(mut uids: Vec<Uid>) -> Vec<Uid> {
    uids.sort();
    uids
}

#[test]
fn hot_parent_under_contention() {
    let config = GraphConfig::default()
        .embedded_threshold(4)
        .max_overflow(3)
        .overflow_batch_limit(5)
        .with_lock_timeout(Duration::from_secs(10));
    let h = Harness::new(config);
    let parent = h.person("hub", 50);
    let kids: Vec<_> = (0..32).map(|i| h.person(&format!("k{i}"), i)).collect();
    let barrier = Arc::new(Barrier::new(kids.len()));

    let handles: Vec<_> = kids
        .iter()
        .map(|kid| {
            let graph = Arc::clone(&h.graph);
            let barrier = Arc::clone(&barrier);
            let kid = *kid;
            thread::spawn(move || {
                barrier.wait();
                graph.attach_edge(kid, parent, "Friends")
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Vec::<GraphError>::new());
    }

    let row = h.adjacency(parent);
    assert!(row.slots.iter().filter(|s| s.state.is_overflow()).count() <= 3);
    assert!(row
        .slots
        .iter()
        .all(|s| s.state != SlotState::CuidInUse && s.state != SlotState::OuidInUse));
    let view = h.graph.children(parent, "Friends").unwrap();
    assert_eq!(sorted(view.children()), sorted(kids));
}

#[test]
fn crossing_and_self_edges_complete() {
    let h = Harness::new(GraphConfig::default().with_lock_timeout(Duration::from_secs(10)));
    let a = h.person("a", 1);
    let b = h.person("b", 2);
    let pairs = [(a, b), (b, a), (a, a), (b, b)];
    let barrier = Arc::new(Barrier::new(pairs.len()));

    let handles: Vec<_> = pairs
        .iter()
        .map(|&(child, parent)| {
            let graph = Arc::clone(&h.graph);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                graph.attach_edge(child, parent, "Friends")
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_empty());
    }

    assert_eq!(sorted(h.graph.children(a, "Friends").unwrap().children()), sorted(vec![a, b]));
    assert_eq!(sorted(h.graph.children(b, "Friends").unwrap().children()), sorted(vec![a, b]));
}

#[test]
fn attach_and_detach_interleave() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(2));
    let parent = h.person("hub", 50);
    let kids: Vec<_> = (0..12).map(|i| h.person(&format!("k{i}"), i)).collect();
    for kid in &kids[..6] {
        assert!(h.graph.attach_edge(*kid, parent, "Friends").is_empty());
    }

    let mut handles = Vec::new();
    for kid in kids[..6].iter().copied() {
        let graph = Arc::clone(&h.graph);
        handles.push(thread::spawn(move || {
            graph.detach_edge(kid, parent, "Friends").map(|()| Vec::new()).unwrap_or_else(|e| vec![e])
        }));
    }
    for kid in kids[6..].iter().copied() {
        let graph = Arc::clone(&h.graph);
        handles.push(thread::spawn(move || graph.attach_edge(kid, parent, "Friends")));
    }
    for handle in handles {
        assert!(handle.join().unwrap().is_empty());
    }

    let view = h.graph.children(parent, "Friends").unwrap();
    assert_eq!(sorted(view.children()), sorted(kids[6..].to_vec()));
}

#[test]
fn scheduler_serializes_shared_endpoints() {
    let h = Harness::new(GraphConfig::default().embedded_threshold(3).attach_ceiling(4));
    let hubs: Vec<_> = (0..3).map(|i| h.person(&format!("hub{i}"), i)).collect();
    let kids: Vec<_> = (0..9).map(|i| h.person(&format!("k{i}"), i)).collect();

    let throttle = Arc::new(Throttle::start(2));
    let scheduler = h.graph.scheduler(Arc::clone(&throttle)).unwrap();
    let mut tickets = Vec::new();
    for (idx, kid) in kids.iter().enumerate() {
        let hub = hubs[idx % hubs.len()];
        tickets.push(scheduler.submit(EdgeRequest::new(*kid, hub, "Friends")).unwrap());
    }
    tickets.push(scheduler.submit(EdgeRequest::new(kids[0], hubs[0], "Friends")).unwrap());

    let mut outcomes: Vec<_> = tickets.into_iter().map(|t| t.wait()).collect();
    let duplicate = outcomes.pop().unwrap();
    assert!(matches!(duplicate.as_slice(), [GraphError::EdgeAlreadyExists { .. }]));
    assert!(outcomes.iter().all(Vec::is_empty));

    scheduler.wait_idle().unwrap();
    let stats = scheduler.stats().unwrap();
    assert_eq!(stats.completed, 10);
    assert!(stats.peak_in_flight <= 3);
    let ceiling = throttle
        .snapshot()
        .unwrap()
        .into_iter()
        .find(|class| class.class == "attach")
        .map(|class| class.ceiling);
    assert_eq!(ceiling, Some(4));
    for (idx, hub) in hubs.iter().enumerate() {
        let expected: Vec<_> = kids.iter().copied().skip(idx).step_by(hubs.len()).collect();
        assert_eq!(h.graph.children(*hub, "Friends").unwrap().children(), expected);
    }
}
