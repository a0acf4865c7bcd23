use std::ptr::null_mut;
use std::sync::atomic::fence;
#[cfg(feature = "validation")]
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use atomic::Ordering;

use crate::header::{alloc_object, dealloc_object, Gc};
use crate::suspects::SuspectSet;
use crate::sync::RawSpinLock;

/// A reference-counted heap with a concurrent cycle collector attached.
///
/// Every object operation goes through its owning `Heap` so the count
/// runtime can reach the suspect registry, and so independent heaps can
/// coexist in one process.
pub struct Heap {
    pub(crate) suspects: SuspectSet,
    /// Single-writer guard: one collection pass at a time.
    pub(crate) gc_lock: RawSpinLock,
    #[cfg(feature = "validation")]
    live: AtomicUsize,
}

impl Heap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            suspects: SuspectSet::new(),
            gc_lock: RawSpinLock::new(),
            #[cfg(feature = "validation")]
            live: AtomicUsize::new(0),
        })
    }

    /// Allocate an object with `field_length` null slots and one owning
    /// reference. Returns `None` when the allocator refuses.
    pub fn try_allocate(&self, field_length: usize) -> Option<Gc> {
        let object = alloc_object(field_length);
        if object.is_null() {
            return None;
        }
        #[cfg(feature = "validation")]
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(Gc::from_raw(object))
    }

    pub fn allocate(&self, field_length: usize) -> Gc {
        match self.try_allocate(field_length) {
            Some(object) => object,
            None => oom_abort(),
        }
    }

    /// Add one reference.
    ///
    /// # Safety
    /// `object` must point to a live allocation of this heap.
    pub unsafe fn retain(&self, object: Gc) {
        object.header().increment();
    }

    /// Drop one reference.
    ///
    /// A cyclic-typed object that survives the decrement is enrolled as a
    /// suspected cycle root. A cyclic-typed object that dies is not freed
    /// here: the collector may be mid-scan somewhere in its closure, so it
    /// is marked through the deferred-release path and the collector frees
    /// the storage later. Acyclic objects tear down immediately.
    ///
    /// # Safety
    /// `object` must carry a reference the caller owns; the handle must
    /// not be used after the call.
    pub unsafe fn release(&self, object: Gc) {
        let mut pending = vec![object];
        while let Some(object) = pending.pop() {
            let header = object.header();
            let prev = header.decrement();
            debug_assert!(prev != 0, "release of a dead object");
            if prev > 1 {
                // A count that drops but stays positive is the only hint
                // the collector ever gets that a cyclic object may have
                // lost its last external reference.
                if header.cyclic() {
                    self.try_enroll(object);
                }
                continue;
            }
            fence(Ordering::Acquire);
            if header.cyclic() {
                self.deferred_release(object);
                self.try_enroll(object);
            } else {
                for slot in header.fields() {
                    let child = slot.load(Ordering::Relaxed);
                    if !child.is_null() {
                        pending.push(Gc::from_raw(child));
                    }
                }
                self.free_object(object);
            }
        }
    }

    /// Win the `buffered` ticket and enroll, or do nothing if the object
    /// is already registered.
    pub(crate) unsafe fn try_enroll(&self, object: Gc) {
        if object
            .header()
            .buffered
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.suspects.enroll(object);
        }
    }

    /// Deferred release of a cyclic-typed object whose count reached zero:
    /// drop the references its fields hold, sever the edges that would
    /// otherwise be dropped twice, and mark the storage for the collector
    /// instead of freeing it.
    unsafe fn deferred_release(&self, object: Gc) {
        let mut worklist = vec![object];
        while let Some(object) = worklist.pop() {
            let header = object.header();
            let mut survivors = Vec::new();
            header.lock.lock();
            for slot in header.fields() {
                let child_ptr = slot.load(Ordering::Relaxed);
                if child_ptr.is_null() {
                    continue;
                }
                let child = Gc::from_raw(child_ptr);
                let prev = child.header().decrement();
                if prev == 1 {
                    fence(Ordering::Acquire);
                    // A dying child that is independently enrolled as a
                    // suspected root will be freed through the registry;
                    // unlink it so this subgraph cannot free it twice. A
                    // dying child that is not stays linked: the collector
                    // discovers it through this edge.
                    if child.header().cyclic() && child.header().buffered.load(Ordering::Acquire)
                    {
                        slot.store(null_mut(), Ordering::Relaxed);
                    }
                    worklist.push(child);
                } else {
                    // The child survives; unlink so a later reclamation of
                    // this object does not decrement it a second time.
                    slot.store(null_mut(), Ordering::Relaxed);
                    if child.header().cyclic() {
                        survivors.push(child);
                    }
                }
            }
            header.lock.unlock();
            // Registry traffic and the cascade into children run with no
            // object lock held; this path never owns two locks at once.
            for child in survivors {
                self.try_enroll(child);
            }
            header.ready_to_release.store(true, Ordering::Release);
        }
    }

    /// Store `value` into `object.slot[index]`, adjusting counts on both
    /// the incoming and the displaced reference. On a shared object the
    /// write happens under the object's spin lock and anything stored
    /// escapes along with it, so `value` is promoted first.
    ///
    /// # Safety
    /// `object` (and `value`, if any) must point to live allocations and
    /// `index` must be within `field_length`.
    pub unsafe fn store_field(&self, object: Gc, index: usize, value: Option<Gc>) {
        let header = object.header();
        debug_assert!(index < header.field_length, "field index out of range");
        let slot = &header.fields()[index];
        let new_ptr = value.map_or(null_mut(), Gc::as_ptr);
        let old = if header.shared() {
            if let Some(value) = value {
                self.promote_to_shared(value);
            }
            header.lock.lock();
            let old = slot.load(Ordering::Relaxed);
            if let Some(value) = value {
                value.header().increment();
            }
            slot.store(new_ptr, Ordering::Relaxed);
            header.lock.unlock();
            old
        } else {
            let old = slot.load(Ordering::Relaxed);
            if let Some(value) = value {
                value.header().increment();
            }
            slot.store(new_ptr, Ordering::Relaxed);
            old
        };
        // The displaced reference is dropped outside the lock.
        if !old.is_null() {
            self.release(Gc::from_raw(old));
        }
    }

    /// Read `object.slot[index]`, under the object's spin lock when it is
    /// shared. The returned handle is already retained for the caller: a
    /// bare pointer read could be freed before use once the lock is gone.
    /// Release it when done.
    ///
    /// # Safety
    /// `object` must point to a live allocation and `index` must be within
    /// `field_length`.
    pub unsafe fn load_field(&self, object: Gc, index: usize) -> Option<Gc> {
        let header = object.header();
        debug_assert!(index < header.field_length, "field index out of range");
        let slot = &header.fields()[index];
        let ptr = if header.shared() {
            header.lock.lock();
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                (*ptr).increment();
            }
            header.lock.unlock();
            ptr
        } else {
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                (*ptr).increment();
            }
            ptr
        };
        if ptr.is_null() {
            None
        } else {
            Some(Gc::from_raw(ptr))
        }
    }

    /// Flag an object as possibly participating in reference cycles.
    /// Monotonic. Only such objects are ever enrolled as suspected roots.
    ///
    /// # Safety
    /// `object` must point to a live allocation.
    pub unsafe fn mark_cyclic(&self, object: Gc) {
        object.header().is_cyclic_type.store(true, Ordering::Relaxed);
    }

    /// Escape hook: flip `object` and its whole reachable closure to
    /// shared, atomically counted mode. Called before a thread-local
    /// object becomes visible to other threads. [`Heap::store_field`] into
    /// a shared object invokes this itself.
    ///
    /// # Safety
    /// `object` must point to a live allocation.
    pub unsafe fn promote_to_shared(&self, object: Gc) {
        object.header().promote_transitively();
    }

    pub(crate) unsafe fn free_object(&self, object: Gc) {
        dealloc_object(object.as_ptr());
        #[cfg(feature = "validation")]
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of objects currently enrolled as suspected cycle roots.
    pub fn suspect_count(&self) -> usize {
        self.suspects.len()
    }

    /// Live allocation count, maintained in validation builds.
    #[cfg(feature = "validation")]
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cold]
fn oom_abort() -> ! {
    eprintln!("FATAL: Out of memory");
    std::process::abort()
}
