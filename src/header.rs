use std::{
    alloc::{alloc, dealloc, Layout},
    collections::HashSet,
    mem::{align_of, size_of},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize},
};

use atomic::Ordering;

use crate::sync::RawSpinLock;

// An object is one contiguous region: this header followed by
// `field_length` reference slots.
//
// +------------------+---------------------------------------------------+
// | name             |                                                   |
// +------------------+---------------------------------------------------+
// | ref_count        | Strong count. Relaxed load/store pairs while the  |
// |                  | object is thread-local, atomic rmw once shared.   |
// | field_length     | Number of slots, immutable after construction.    |
// | is_shared        | Monotonic false -> true on escape.                |
// | is_cyclic_type   | Monotonic false -> true; only such objects are    |
// |                  | ever enrolled as suspected cycle roots.           |
// | lock             | Serializes field writes and collector scans.      |
// | ready_to_release | The storage may be reclaimed by the collector.    |
// | buffered         | The object currently sits in the suspect set.     |
// +------------------+---------------------------------------------------+
//
// Slots hold raw pointers so the collector can walk and mutate the graph
// without going through any counted handle. They are atomics even on the
// thread-local path: the collector may scan an enrolled object while its
// owner is still running, and a plain read would race.
#[repr(C)]
pub struct HeapObjectHeader {
    pub(crate) ref_count: AtomicUsize,
    pub(crate) field_length: usize,
    pub(crate) is_shared: AtomicBool,
    pub(crate) is_cyclic_type: AtomicBool,
    pub(crate) lock: RawSpinLock,
    pub(crate) ready_to_release: AtomicBool,
    pub(crate) buffered: AtomicBool,
}

impl HeapObjectHeader {
    #[inline(always)]
    pub(crate) fn fields(&self) -> &[AtomicPtr<HeapObjectHeader>] {
        unsafe {
            let start = (self as *const Self).add(1) as *const AtomicPtr<HeapObjectHeader>;
            std::slice::from_raw_parts(start, self.field_length)
        }
    }

    #[inline(always)]
    pub(crate) fn shared(&self) -> bool {
        self.is_shared.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn cyclic(&self) -> bool {
        self.is_cyclic_type.load(Ordering::Relaxed)
    }

    /// Add one reference, dispatching on `is_shared`.
    #[inline]
    pub(crate) fn increment(&self) {
        if self.shared() {
            self.ref_count.fetch_add(1, Ordering::Relaxed);
        } else {
            // Thread-local: nothing else observes the count, skip the rmw.
            let count = self.ref_count.load(Ordering::Relaxed);
            self.ref_count.store(count + 1, Ordering::Relaxed);
        }
    }

    /// Drop one reference, dispatching on `is_shared`. Returns the count
    /// observed before the subtraction.
    #[inline]
    pub(crate) fn decrement(&self) -> usize {
        if self.shared() {
            self.ref_count.fetch_sub(1, Ordering::Release)
        } else {
            let count = self.ref_count.load(Ordering::Relaxed);
            self.ref_count.store(count - 1, Ordering::Relaxed);
            count
        }
    }

    /// Flip this object and everything reachable through its fields into
    /// shared, atomically counted mode. Monotonic; objects already flipped
    /// terminate the walk, so a cyclic graph is handled fine. Takes no
    /// locks: the subgraph is still owned by the escaping thread and the
    /// store that publishes it provides the ordering.
    pub(crate) fn promote_transitively(&self) {
        if self.is_shared.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut pending = vec![self as *const HeapObjectHeader];
        while let Some(object) = pending.pop() {
            let object = unsafe { &*object };
            for slot in object.fields() {
                let child = slot.load(Ordering::Relaxed);
                if child.is_null() {
                    continue;
                }
                let child = unsafe { &*child };
                if !child.is_shared.swap(true, Ordering::Relaxed) {
                    pending.push(child as *const HeapObjectHeader);
                }
            }
        }
    }
}

/// Untyped handle to a heap object. Copying a `Gc` does not touch the
/// reference count; callers pair it with [`Heap::retain`](crate::Heap::retain)
/// and [`Heap::release`](crate::Heap::release).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gc {
    pub(crate) base: NonNull<HeapObjectHeader>,
}

unsafe impl Send for Gc {}
unsafe impl Sync for Gc {}

impl Gc {
    #[inline(always)]
    pub(crate) fn from_raw(ptr: *mut HeapObjectHeader) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            base: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    #[inline(always)]
    pub(crate) fn as_ptr(self) -> *mut HeapObjectHeader {
        self.base.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &HeapObjectHeader {
        unsafe { self.base.as_ref() }
    }

    /// Current strong count. A racy snapshot once the object is shared.
    ///
    /// # Safety
    /// `self` must point to a live allocation.
    pub unsafe fn ref_count(self) -> usize {
        self.header().ref_count.load(Ordering::Relaxed)
    }

    /// # Safety
    /// `self` must point to a live allocation.
    pub unsafe fn is_shared(self) -> bool {
        self.header().shared()
    }

    /// # Safety
    /// `self` must point to a live allocation.
    pub unsafe fn is_cyclic_type(self) -> bool {
        self.header().cyclic()
    }

    /// # Safety
    /// `self` must point to a live allocation.
    pub unsafe fn field_length(self) -> usize {
        self.header().field_length
    }

    /// Debug dump of the graph below `self`: one line per object with its
    /// address, count and outgoing edges, every object printed once.
    ///
    /// # Safety
    /// `self` must point to a live allocation and the graph below it must
    /// not be mutated while the dump runs.
    pub unsafe fn dump(self) -> String {
        use std::fmt::Write;

        let mut seen = HashSet::new();
        let mut pending = vec![self];
        let mut out = String::new();
        while let Some(object) = pending.pop() {
            if !seen.insert(object) {
                continue;
            }
            let header = object.header();
            write!(
                out,
                "{:p} | ref_count : {} |",
                object.base,
                header.ref_count.load(Ordering::Relaxed)
            )
            .unwrap();
            for slot in header.fields() {
                let child = slot.load(Ordering::Relaxed);
                if !child.is_null() {
                    write!(out, " {:p}", child).unwrap();
                    pending.push(Gc::from_raw(child));
                }
            }
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Pointer for Gc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

#[inline]
fn object_layout(field_length: usize) -> Option<Layout> {
    let slots = field_length.checked_mul(size_of::<*mut HeapObjectHeader>())?;
    let size = size_of::<HeapObjectHeader>().checked_add(slots)?;
    Layout::from_size_align(size, align_of::<HeapObjectHeader>()).ok()
}

/// Allocate one contiguous header-plus-slots region with every slot null
/// and a count of one for the reference handed back to the caller. Returns
/// null when the allocator refuses.
pub(crate) fn alloc_object(field_length: usize) -> *mut HeapObjectHeader {
    let layout = match object_layout(field_length) {
        Some(layout) => layout,
        None => return null_mut(),
    };
    unsafe {
        let object = alloc(layout).cast::<HeapObjectHeader>();
        if object.is_null() {
            return null_mut();
        }
        object.write(HeapObjectHeader {
            ref_count: AtomicUsize::new(1),
            field_length,
            is_shared: AtomicBool::new(false),
            is_cyclic_type: AtomicBool::new(false),
            lock: RawSpinLock::new(),
            ready_to_release: AtomicBool::new(false),
            buffered: AtomicBool::new(false),
        });
        let slots = object.add(1).cast::<*mut HeapObjectHeader>();
        for index in 0..field_length {
            slots.add(index).write(null_mut());
        }
        object
    }
}

/// Return the whole region in one free. No per-field teardown happens
/// here; whoever frees is responsible for the counts behind the slots.
///
/// # Safety
/// `object` must come from [`alloc_object`] and must not be used again.
pub(crate) unsafe fn dealloc_object(object: *mut HeapObjectHeader) {
    let size = size_of::<HeapObjectHeader>()
        + (*object).field_length * size_of::<*mut HeapObjectHeader>();
    let layout = Layout::from_size_align_unchecked(size, align_of::<HeapObjectHeader>());
    dealloc(object.cast(), layout);
}

#[cfg(test)]
mod tests {
    use atomic::Ordering;

    use super::{alloc_object, dealloc_object, Gc};

    #[test]
    fn fresh_object_state() {
        let object = Gc::from_raw(alloc_object(3));
        let header = object.header();
        assert_eq!(header.ref_count.load(Ordering::Relaxed), 1);
        assert_eq!(header.field_length, 3);
        assert!(!header.shared());
        assert!(!header.cyclic());
        assert!(!header.ready_to_release.load(Ordering::Relaxed));
        assert!(!header.buffered.load(Ordering::Relaxed));
        assert!(!header.lock.is_locked());
        for slot in header.fields() {
            assert!(slot.load(Ordering::Relaxed).is_null());
        }
        unsafe { dealloc_object(object.as_ptr()) };
    }

    #[test]
    fn promotion_reaches_a_cycle() {
        let a = Gc::from_raw(alloc_object(1));
        let b = Gc::from_raw(alloc_object(1));
        a.header().fields()[0].store(b.as_ptr(), Ordering::Relaxed);
        b.header().fields()[0].store(a.as_ptr(), Ordering::Relaxed);

        a.header().promote_transitively();
        assert!(a.header().shared());
        assert!(b.header().shared());

        unsafe {
            dealloc_object(a.as_ptr());
            dealloc_object(b.as_ptr());
        }
    }
}
