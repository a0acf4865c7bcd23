use rand::Rng;

use crate::{CollectorThread, Gc, Heap};

const TREE_FIELDS: usize = 2;

fn build_tree(heap: &Heap, depth: usize) -> Gc {
    let node = heap.allocate(TREE_FIELDS);
    if depth > 0 {
        for index in 0..TREE_FIELDS {
            let child = build_tree(heap, depth - 1);
            unsafe {
                heap.store_field(node, index, Some(child));
                heap.release(child);
            }
        }
    }
    node
}

fn collect_to_quiescence(heap: &Heap) {
    for _ in 0..100 {
        heap.collect();
        if heap.suspect_count() == 0 {
            return;
        }
    }
    panic!("suspect registry failed to drain");
}

#[test]
fn tree_teardown_needs_no_collector() {
    let heap = Heap::new();
    let root = build_tree(&heap, 10);
    assert_eq!(heap.live_objects(), 2047);
    unsafe { heap.release(root) };
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.suspect_count(), 0);
}

#[test]
fn two_node_cycle_is_reclaimed() {
    let heap = Heap::new();
    let a = heap.allocate(1);
    let b = heap.allocate(1);
    unsafe {
        heap.mark_cyclic(a);
        heap.mark_cyclic(b);
        heap.store_field(a, 0, Some(b));
        heap.store_field(b, 0, Some(a));
        heap.release(a);
        heap.release(b);
    }
    assert_eq!(heap.live_objects(), 2);
    assert_eq!(heap.suspect_count(), 2);

    heap.collect();
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.suspect_count(), 0);
}

#[test]
fn external_reference_keeps_cycle_alive() {
    let heap = Heap::new();
    let a = heap.allocate(1);
    let b = heap.allocate(1);
    let c = heap.allocate(1);
    unsafe {
        for &object in &[a, b, c] {
            heap.mark_cyclic(object);
        }
        heap.store_field(a, 0, Some(b));
        heap.store_field(b, 0, Some(c));
        heap.store_field(c, 0, Some(a));
        heap.release(a);
        heap.release(b);
    }
    assert_eq!(heap.live_objects(), 3);

    heap.collect();
    heap.collect();
    assert_eq!(heap.live_objects(), 3);
    unsafe {
        assert_eq!(c.ref_count(), 2);
        assert!(a.is_cyclic_type());
    }

    // Dropping the last external handle makes the whole ring garbage.
    unsafe { heap.release(c) };
    heap.collect();
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.suspect_count(), 0);
}

#[test]
fn cycle_with_live_acyclic_substructure() {
    let heap = Heap::new();
    let a = heap.allocate(1);
    let b = heap.allocate(2);
    let d = heap.allocate(0);
    unsafe {
        heap.mark_cyclic(a);
        heap.mark_cyclic(b);
        heap.store_field(a, 0, Some(b));
        heap.store_field(b, 0, Some(a));
        heap.store_field(b, 1, Some(d));
        heap.release(a);
        heap.release(b);
    }
    assert_eq!(heap.live_objects(), 3);

    heap.collect();
    // The ring is gone; the externally held leaf lost only the ring's
    // contribution.
    assert_eq!(heap.live_objects(), 1);
    unsafe {
        assert_eq!(d.ref_count(), 1);
        heap.release(d);
    }
    assert_eq!(heap.live_objects(), 0);
}

#[test]
fn concurrent_mutators_and_collector() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 10_000;
    const GLOBAL_SLOTS: usize = 10;

    let heap = Heap::new();
    let global = heap.allocate(GLOBAL_SLOTS);
    unsafe { heap.promote_to_shared(global) };
    for index in 0..GLOBAL_SLOTS {
        let object = heap.allocate(TREE_FIELDS);
        unsafe {
            heap.mark_cyclic(object);
            heap.store_field(global, index, Some(object));
            heap.release(object);
        }
    }

    let collector = CollectorThread::spawn(&heap);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let heap = heap.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERATIONS {
                    if rng.gen_bool(0.5) {
                        // Publish a fresh batch of cycle candidates,
                        // displacing whatever occupied the slots.
                        for _ in 0..3 {
                            let object = heap.allocate(TREE_FIELDS);
                            unsafe {
                                heap.mark_cyclic(object);
                                heap.store_field(
                                    global,
                                    rng.gen_range(0..GLOBAL_SLOTS),
                                    Some(object),
                                );
                                heap.release(object);
                            }
                        }
                    } else {
                        // Randomly link published objects, closing rings
                        // often enough to matter.
                        unsafe {
                            let first = heap
                                .load_field(global, rng.gen_range(0..GLOBAL_SLOTS))
                                .unwrap();
                            let second = heap
                                .load_field(global, rng.gen_range(0..GLOBAL_SLOTS))
                                .unwrap();
                            let third = heap
                                .load_field(global, rng.gen_range(0..GLOBAL_SLOTS))
                                .unwrap();
                            let link = rng.gen_range(0..TREE_FIELDS);
                            heap.store_field(first, link, Some(second));
                            heap.store_field(second, link, Some(third));
                            if rng.gen_bool(0.5) {
                                heap.store_field(third, link, Some(first));
                            }
                            heap.release(first);
                            heap.release(second);
                            heap.release(third);
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    collector.stop();

    for index in 0..GLOBAL_SLOTS {
        unsafe { heap.store_field(global, index, None) };
    }
    unsafe { heap.release(global) };

    collect_to_quiescence(&heap);
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.suspect_count(), 0);
}

#[test]
fn escape_promotes_whole_subtree() {
    let heap = Heap::new();
    let root = build_tree(&heap, 4);
    unsafe {
        assert!(!root.is_shared());

        let global = heap.allocate(1);
        heap.promote_to_shared(global);
        heap.store_field(global, 0, Some(root));
        assert_subtree_shared(&heap, root);

        heap.release(root);
        heap.release(global);
    }
    assert_eq!(heap.live_objects(), 0);
}

unsafe fn assert_subtree_shared(heap: &Heap, node: Gc) {
    assert!(node.is_shared());
    for index in 0..node.field_length() {
        if let Some(child) = heap.load_field(node, index) {
            assert_subtree_shared(heap, child);
            heap.release(child);
        }
    }
}

#[test]
fn graph_dump_lists_every_object_once() {
    let heap = Heap::new();
    let a = heap.allocate(1);
    let b = heap.allocate(1);
    unsafe {
        heap.mark_cyclic(a);
        heap.mark_cyclic(b);
        heap.store_field(a, 0, Some(b));
        heap.store_field(b, 0, Some(a));

        let dump = a.dump();
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.contains("ref_count : 2"));

        heap.release(a);
        heap.release(b);
    }
    collect_to_quiescence(&heap);
    assert_eq!(heap.live_objects(), 0);
}
