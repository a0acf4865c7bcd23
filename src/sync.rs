use std::sync::atomic::AtomicBool;

use atomic::Ordering;

/// Embeddable test-and-set lock.
///
/// `lock` busy-waits until the flag is won with acquire ordering and
/// `unlock` clears it with release ordering. No fairness, no poisoning.
/// Every object header embeds one of these, and the collector's
/// single-writer guard is one as well.
pub struct RawSpinLock {
    flag: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
