use std::collections::HashSet;

use parking_lot::Mutex;

use crate::header::Gc;

/// Process-wide set of objects suspected to be roots of reference cycles.
///
/// The `buffered` flag on the object header is the admission ticket:
/// callers win its false -> true CAS before inserting, so the set never
/// holds duplicates and an object is enrolled at most once until the
/// collector takes it back out.
pub(crate) struct SuspectSet {
    objects: Mutex<HashSet<Gc>>,
}

impl SuspectSet {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashSet::new()),
        }
    }

    /// Insert a fresh suspect. The caller must hold the `buffered` ticket.
    pub fn enroll(&self, object: Gc) {
        self.objects.lock().insert(object);
    }

    /// Swap the contents out, leaving the set empty so mutators keep
    /// enrolling into it while a collection pass runs on the drained half.
    pub fn drain(&self) -> HashSet<Gc> {
        std::mem::take(&mut *self.objects.lock())
    }

    /// Put back a root the collector could not reclaim this pass.
    pub fn re_enroll(&self, object: Gc) {
        self.objects.lock().insert(object);
    }

    /// Drop a reclaimed object that re-entered the live set mid-pass.
    pub fn remove(&self, object: Gc) {
        self.objects.lock().remove(&object);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::SuspectSet;
    use crate::header::{alloc_object, dealloc_object, Gc};

    #[test]
    fn drain_swaps_out_everything() {
        let suspects = SuspectSet::new();
        let a = Gc::from_raw(alloc_object(0));
        let b = Gc::from_raw(alloc_object(0));

        suspects.enroll(a);
        suspects.enroll(b);
        suspects.enroll(b);
        assert_eq!(suspects.len(), 2);

        let drained = suspects.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(suspects.len(), 0);

        suspects.re_enroll(a);
        assert_eq!(suspects.len(), 1);
        suspects.remove(a);
        assert_eq!(suspects.len(), 0);

        unsafe {
            dealloc_object(a.as_ptr());
            dealloc_object(b.as_ptr());
        }
    }
}
