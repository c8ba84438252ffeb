//! Waker that unparks an OS thread.
//!
//! Queued requests store a [`Waker`] regardless of who is waiting. Blocking
//! callers park their thread and hand the manager one of these, so the
//! rescan path wakes threads and async tasks the same way.

use std::sync::Arc;
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Returns a [`Waker`] that unparks the calling thread.
pub(crate) fn current_thread_waker() -> Waker {
    Waker::from(Arc::new(ThreadWaker(thread::current())))
}
