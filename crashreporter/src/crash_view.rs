//! Values published to the crash hook through a single atomic pointer.
//!
//! The hook can fault on any thread, including one that has never touched
//! the rest of the crate, so reading must not need thread-local state, locks
//! or the allocator. Readers announce themselves on a counter before loading
//! the pointer. A writer that swaps in a new value only frees the values it
//! replaced once it observes no readers, otherwise they are retired and freed
//! by a later publish.

#![allow(unsafe_code)]

use std::sync::{
    Arc,
    atomic::{AtomicPtr, AtomicUsize, Ordering},
};

pub(crate) struct CrashView<T> {
    current: AtomicPtr<T>,
    readers: AtomicUsize,
    retired: parking_lot::Mutex<Vec<Arc<T>>>,
}

// SAFETY: the view hands out shared references to `T` across threads and
// owns `Arc<T>`s, the same requirements as `Arc<T>` itself
unsafe impl<T: Send + Sync> Send for CrashView<T> {}
unsafe impl<T: Send + Sync> Sync for CrashView<T> {}

impl<T> Default for CrashView<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> CrashView<T> {
    pub(crate) const fn empty() -> Self {
        Self {
            current: AtomicPtr::new(std::ptr::null_mut()),
            readers: AtomicUsize::new(0),
            retired: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn new(value: Arc<T>) -> Self {
        let view = Self::empty();
        view.publish(Some(value));
        view
    }

    /// Replaces the published value, returning whether one was published
    /// before. Must not be called from the crash hook.
    pub(crate) fn publish(&self, value: Option<Arc<T>>) -> bool {
        let next = value.map_or(std::ptr::null_mut(), |v| Arc::into_raw(v).cast_mut());

        let mut retired = self.retired.lock();
        let previous = self.current.swap(next, Ordering::SeqCst);
        let had_value = !previous.is_null();

        if had_value {
            // SAFETY: every non-null pointer stored in `current` came from
            // `Arc::into_raw` and is swapped out exactly once
            retired.push(unsafe { Arc::from_raw(previous) });
        }

        // A reader that registers after this load also loads `current` after
        // the swap above, so it can only see `next`
        if self.readers.load(Ordering::SeqCst) == 0 {
            retired.clear();
        }

        had_value
    }

    /// Borrows the published value. Usable from the crash hook: a pair of
    /// atomic operations and a pointer load.
    #[inline]
    pub(crate) fn read(&self) -> Option<CrashRef<'_, T>> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let ptr = self.current.load(Ordering::SeqCst);

        if ptr.is_null() {
            self.readers.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        Some(CrashRef { view: self, ptr })
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        !self.current.load(Ordering::SeqCst).is_null()
    }
}

impl<T> Drop for CrashView<T> {
    fn drop(&mut self) {
        let ptr = *self.current.get_mut();
        if !ptr.is_null() {
            // SAFETY: the pointer came from `Arc::into_raw` and nothing can
            // be reading it while we are being dropped
            drop(unsafe { Arc::from_raw(ptr) });
        }
    }
}

/// A published value, kept alive for as long as the reference exists
pub(crate) struct CrashRef<'view, T> {
    view: &'view CrashView<T>,
    ptr: *const T,
}

impl<T> std::ops::Deref for CrashRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the registered reader keeps the publisher from freeing the
        // value until we are dropped
        unsafe { &*self.ptr }
    }
}

impl<T> Drop for CrashRef<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.view.readers.fetch_sub(1, Ordering::SeqCst);
    }
}
