//! Test waker utilities for polling [`RangeLockFuture`]s by hand.
//!
//! [`RangeLockFuture`]: crate::RangeLockFuture

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{RawWaker, RawWakerVTable, Wake, Waker};

/// Creates a [`Waker`] that does nothing when woken.
pub(crate) fn noop_waker() -> Waker {
    Waker::noop().clone()
}

struct CountingWaker(Arc<AtomicUsize>);

impl Wake for CountingWaker {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates a [`Waker`] that increments a counter each time it is woken.
///
/// Returns the waker and the counter that tracks wake calls.
pub(crate) fn counting_waker() -> (Waker, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let waker = Waker::from(Arc::new(CountingWaker(counter.clone())));
    (waker, counter)
}

std::thread_local! {
    static REENTERED: core::cell::Cell<*const crate::RangeLock> =
        const { core::cell::Cell::new(core::ptr::null()) };
}

static REENTRANT_VTABLE: RawWakerVTable =
    RawWakerVTable::new(reentrant_clone, reenter, reenter, reenter);

fn reenter_lock() {
    REENTERED.with(|lock| {
        let lock = lock.get();
        if !lock.is_null() {
            // SAFETY: `reentrant_waker` callers clear the pointer before the
            // manager goes away.
            let _ = unsafe { &*lock }.len();
        }
    });
}

unsafe fn reentrant_clone(data: *const ()) -> RawWaker {
    reenter_lock();
    RawWaker::new(data, &REENTRANT_VTABLE)
}

unsafe fn reenter(_data: *const ()) {
    reenter_lock();
}

/// Creates a [`Waker`] that takes `lock`'s sequence lock on every clone,
/// wake and drop, so running any of them under that lock spins forever.
///
/// Wakers with different `tag`s do not `will_wake` each other. The calling
/// thread must call [`release_reentrant`] before `lock` is dropped.
pub(crate) fn reentrant_waker(lock: &crate::RangeLock, tag: usize) -> Waker {
    REENTERED.with(|cell| cell.set(lock));
    // SAFETY: the vtable ignores the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::without_provenance(tag), &REENTRANT_VTABLE)) }
}

/// Stops wakers from [`reentrant_waker`] touching their manager.
pub(crate) fn release_reentrant() {
    REENTERED.with(|cell| cell.set(core::ptr::null()));
}
