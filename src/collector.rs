//! Concurrent partial mark and sweep.
//!
//! One [`Heap::collect`] pass drains the suspect registry and analyses
//! each drained root under locks: mark-red freezes and colors the root's
//! closure, mark-gray trial-deletes internal edges into a per-pass count
//! table, and mark-white / mark-black split the closure into garbage and
//! survivors. A root that turns out not to sit on a cycle is instead
//! checked against the mutators' deferred-release marks, so destruction of
//! acyclic objects stays on the thread that dropped the last reference.
//!
//! The scheme is the partial mark and sweep of Bacon and Rajan
//! (<https://pages.cs.wisc.edu/~cymen/misc/interests/Bacon01Concurrent.pdf>)
//! with the synchronization needed to keep mutators running: no phase ever
//! stops the world, and the only freeze is the span of spin locks mark-red
//! acquires over one root's closure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use atomic::Ordering;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::header::Gc;
use crate::heap::Heap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Gray,
    White,
    Black,
}

impl Heap {
    /// Run one collection pass. Single-writer: concurrent callers
    /// serialize on the collector lock. Safe to invoke any number of
    /// times; a pass over an empty registry is a no-op.
    pub fn collect(&self) {
        self.gc_lock.lock();

        let mut roots = self.suspects.drain();
        let mut release_set: HashSet<Gc> = HashSet::new();

        for &root in &roots {
            unsafe { self.analyze_root(root, &mut release_set) };
        }

        unsafe {
            // Counts first, storage second: edges leaving the release set
            // still carry real contributions to survivors, and the
            // ready_to_release checks below must still be able to read
            // sibling headers.
            for &object in &release_set {
                roots.remove(&object);
                let header = object.header();
                if header.cyclic() && header.buffered.load(Ordering::Relaxed) {
                    // It may have been enrolled again after the drain.
                    self.suspects.remove(object);
                }
                for slot in header.fields() {
                    let child = slot.load(Ordering::Relaxed);
                    if child.is_null() {
                        continue;
                    }
                    if !(*child).ready_to_release.load(Ordering::Acquire) {
                        self.release(Gc::from_raw(child));
                    }
                }
            }
            for &object in &release_set {
                self.free_object(object);
            }
        }

        // Whatever survived may still become a cycle root later: the graph
        // can have mutated the moment the locks went up.
        for &root in &roots {
            self.suspects.re_enroll(root);
        }

        self.gc_lock.unlock();
    }

    /// Decide the fate of one drained root and collect everything found
    /// reclaimable into `release_set`.
    unsafe fn analyze_root(&self, root: Gc, release_set: &mut HashSet<Gc>) {
        let mut colors: HashMap<Gc, Color> = HashMap::new();
        let mut visited: Vec<Gc> = Vec::new();
        let is_cyclic_root = mark_red(root, &mut colors, &mut visited);

        if is_cyclic_root {
            let mut counts: HashMap<Gc, usize> = HashMap::new();
            mark_gray(root, &mut colors, &mut counts);
            mark_white(root, &mut colors, &counts);
            for &object in &visited {
                if colors[&object] == Color::White {
                    // Fully accounted for by edges inside the closure.
                    object
                        .header()
                        .ready_to_release
                        .store(true, Ordering::Release);
                    release_set.insert(object);
                }
            }
            for &object in &visited {
                object.header().lock.unlock();
            }
        } else {
            // Not on a cycle: the root is garbage only if the mutator that
            // dropped it already marked the whole closure through deferred
            // release. The marks are sticky, so the freeze can end first.
            for &object in &visited {
                object.header().lock.unlock();
            }
            let mut closure = HashSet::new();
            if check_ready_to_collect(root, &mut closure) {
                release_set.extend(closure);
            }
        }
    }
}

/// Lock-acquiring DFS from `root`: color everything reachable red and
/// leave every visited object's spin lock held, freezing the closure
/// against field writes. Returns whether some field anywhere in the
/// closure points back at `root`.
unsafe fn mark_red(root: Gc, colors: &mut HashMap<Gc, Color>, visited: &mut Vec<Gc>) -> bool {
    let mut is_cyclic_root = false;
    let mut pending = vec![root];
    while let Some(object) = pending.pop() {
        if colors.contains_key(&object) {
            continue;
        }
        colors.insert(object, Color::Red);
        let header = object.header();
        header.lock.lock();
        visited.push(object);
        for slot in header.fields().iter().rev() {
            let child = slot.load(Ordering::Relaxed);
            if child.is_null() {
                continue;
            }
            let child = Gc::from_raw(child);
            if child == root {
                is_cyclic_root = true;
            }
            pending.push(child);
        }
    }
    is_cyclic_root
}

/// Trial deletion: give every object in the closure a scratch count equal
/// to its reference count minus the edges arriving from inside the
/// closure. A scratch count of zero means nothing outside the closure
/// holds the object.
unsafe fn mark_gray(root: Gc, colors: &mut HashMap<Gc, Color>, counts: &mut HashMap<Gc, usize>) {
    let mut pending = vec![(root, true)];
    while let Some((object, is_first)) = pending.pop() {
        if colors.get(&object) == Some(&Color::Gray) {
            // Another internal edge arrives here; account for it.
            if let Some(count) = counts.get_mut(&object) {
                *count = count.wrapping_sub(1);
            }
            continue;
        }
        colors.insert(object, Color::Gray);
        // Atomic read: external handles still retain and release without
        // going through any lock the scan holds.
        let ref_count = object.header().ref_count.load(Ordering::Acquire);
        // Deferred release severs counts before edges, so a count of zero
        // can be observed on an object that still has an incoming edge
        // here. Wrapping turns the subtraction into a huge value and the
        // object is simply kept for a later pass.
        counts.insert(
            object,
            if is_first {
                ref_count
            } else {
                ref_count.wrapping_sub(1)
            },
        );
        for slot in object.header().fields().iter().rev() {
            let child = slot.load(Ordering::Relaxed);
            if !child.is_null() {
                pending.push((Gc::from_raw(child), false));
            }
        }
    }
}

/// Split the gray closure: objects whose scratch count reached zero are
/// provisionally garbage (white), anything still referenced from outside
/// promotes its whole reachable part back to live (black).
unsafe fn mark_white(root: Gc, colors: &mut HashMap<Gc, Color>, counts: &HashMap<Gc, usize>) {
    let mut pending = vec![root];
    while let Some(object) = pending.pop() {
        if colors.get(&object) != Some(&Color::Gray) {
            continue;
        }
        if counts[&object] != 0 {
            mark_black(object, colors);
            continue;
        }
        colors.insert(object, Color::White);
        for slot in object.header().fields().iter().rev() {
            let child = slot.load(Ordering::Relaxed);
            if !child.is_null() {
                pending.push(Gc::from_raw(child));
            }
        }
    }
}

/// Re-live everything reachable from `from`, overwriting any provisional
/// white. No count changes in this phase.
unsafe fn mark_black(from: Gc, colors: &mut HashMap<Gc, Color>) {
    let mut pending = vec![from];
    while let Some(object) = pending.pop() {
        if colors.get(&object) == Some(&Color::Black) {
            continue;
        }
        colors.insert(object, Color::Black);
        for slot in object.header().fields().iter().rev() {
            let child = slot.load(Ordering::Relaxed);
            if !child.is_null() {
                pending.push(Gc::from_raw(child));
            }
        }
    }
}

/// Acyclic branch: the root is garbage only if deferred release already
/// marked its whole closure reclaimable. One unmarked object aborts the
/// walk and the root stays enrolled for a later pass.
unsafe fn check_ready_to_collect(root: Gc, closure: &mut HashSet<Gc>) -> bool {
    let mut pending = vec![root];
    while let Some(object) = pending.pop() {
        if closure.contains(&object) {
            continue;
        }
        let header = object.header();
        if !header.ready_to_release.load(Ordering::Acquire) {
            return false;
        }
        closure.insert(object);
        header.lock.lock();
        for slot in header.fields() {
            let child = slot.load(Ordering::Relaxed);
            if !child.is_null() {
                pending.push(Gc::from_raw(child));
            }
        }
        header.lock.unlock();
    }
    true
}

/// Background thread that runs [`Heap::collect`] in a loop until told to
/// stop, the way a benchmark harness drives the collector alongside its
/// mutators.
pub struct CollectorThread {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl CollectorThread {
    pub fn spawn(heap: &Arc<Heap>) -> Self {
        let (stop, stop_recv) = flume::bounded(1);
        let heap = heap.clone();
        let thread = std::thread::spawn(move || collector_routine(&heap, &stop_recv));
        Self { stop, thread }
    }

    /// Signal the routine and wait for the pass in flight to finish.
    pub fn stop(self) {
        let _ = self.stop.send(());
        self.thread.join().expect("collector thread panicked");
    }
}

fn collector_routine(heap: &Heap, stop: &Receiver<()>) {
    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }
        heap.collect();
        if heap.suspect_count() == 0 {
            // Nothing suspected; park briefly instead of spinning over an
            // empty registry.
            match stop.recv_timeout(Duration::from_micros(100)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}
