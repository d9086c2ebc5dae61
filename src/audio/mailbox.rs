/// `audio/mailbox.rs` — Single-slot lock-free hand-off
///
/// Holds at most one boxed value. `put` swaps the new value in and returns
/// whatever was there before, so the sender decides what happens to a value
/// the receiver never collected. `take` empties the slot. Both are a single
/// atomic exchange and never allocate or free.
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub struct Mailbox<T> {
    slot: AtomicPtr<T>,
}

// SAFETY: the slot owns at most one `Box<T>`. Ownership moves in and out
// through atomic exchange, so exactly one thread holds any given value.
unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Stores `value`, returning the value it displaced.
    pub fn put(&self, value: Box<T>) -> Option<Box<T>> {
        let old = self.slot.swap(Box::into_raw(value), Ordering::AcqRel);
        // SAFETY: non-null pointers in the slot always come from Box::into_raw
        // and were just removed from it.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }

    pub fn take(&self) -> Option<Box<T>> {
        let old = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: as in `put`.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("full", &!self.is_empty()).finish()
    }
}
