//! Lock owner identifiers.
//!
//! Every request records the owner that issued it. The manager uses owners
//! only for recursion checks ([`RangeLock::may_recurse`]) and diagnostics.
//!
//! [`RangeLock::may_recurse`]: crate::RangeLock::may_recurse

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Next id handed out to a thread on its first call to [`OwnerId::current`].
///
/// Starts in the upper half of the id space so implicit thread ids do not
/// collide with small explicit ids passed to [`OwnerId::new`].
static NEXT_THREAD_OWNER: AtomicU64 = AtomicU64::new(1 << 63);

std::thread_local! {
    static THREAD_OWNER: Cell<u64> = const { Cell::new(0) };
}

/// Identifies the owner of a range-lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Creates an explicit owner id.
    ///
    /// Use this when one logical owner (a transaction, an open file
    /// description) issues requests from several threads.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the id of the calling thread, assigning one on first use.
    pub fn current() -> Self {
        THREAD_OWNER.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_OWNER.fetch_add(1, Ordering::Relaxed));
            }
            Self(id.get())
        })
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_per_thread() {
        assert_eq!(OwnerId::current(), OwnerId::current());
    }

    #[test]
    fn threads_get_distinct_ids() {
        let here = OwnerId::current();
        let there = std::thread::spawn(OwnerId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn explicit_ids_do_not_collide_with_thread_ids() {
        assert_ne!(OwnerId::new(1), OwnerId::current());
        assert_eq!(OwnerId::new(7).as_u64(), 7);
    }
}
