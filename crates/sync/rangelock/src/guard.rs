//! RAII guard for a granted range.

use core::fmt;
use core::mem;

use crate::manager::RangeLock;
use crate::range::{LockMode, Range};
use crate::sequence::Cookie;

/// RAII guard that releases its range when dropped.
///
/// Dropping the guard runs the release and the rescan that may grant
/// requests queued behind it.
#[must_use = "the range is unlocked as soon as the guard is dropped"]
pub struct RangeGuard<'a> {
    lock: &'a RangeLock,
    cookie: Cookie,
    range: Range,
    mode: LockMode,
}

impl<'a> RangeGuard<'a> {
    pub(crate) fn new(lock: &'a RangeLock, cookie: Cookie, range: Range, mode: LockMode) -> Self {
        Self {
            lock,
            cookie,
            range,
            mode,
        }
    }

    /// Returns the locked range.
    pub fn range(&self) -> Range {
        self.range
    }

    /// Returns the mode the range is held in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Returns the cookie naming this request.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Returns the manager this guard belongs to.
    pub fn lock_ref(&self) -> &'a RangeLock {
        self.lock
    }

    /// Debug-asserts that the guard's request is still granted.
    #[track_caller]
    pub fn assert_held(&self) {
        self.lock.assert_held(self.cookie, self.mode);
    }

    /// Forgets the guard and returns its cookie.
    ///
    /// The range stays locked until the cookie is passed to
    /// [`RangeLock::unlock_raw`].
    pub fn into_cookie(self) -> Cookie {
        let cookie = self.cookie;
        mem::forget(self);
        cookie
    }
}

impl fmt::Debug for RangeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeGuard")
            .field("lock", &self.lock.name())
            .field("cookie", &self.cookie)
            .field("range", &self.range)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_raw(self.cookie);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let lock = RangeLock::named("guard");
        let range = Range::new(8, 16).unwrap();
        let g = lock.rlock(range);
        assert_eq!(g.range(), range);
        assert_eq!(g.mode(), LockMode::Read);
        assert!(core::ptr::eq(g.lock_ref(), &lock));
        g.assert_held();
        let dbg = format!("{g:?}");
        assert!(dbg.contains("\"guard\""), "{dbg}");
    }

    #[test]
    fn into_cookie_keeps_range_locked() {
        let lock = RangeLock::new();
        let range = Range::new(0, 10).unwrap();
        let cookie = lock.wlock(range).into_cookie();
        assert!(lock.try_rlock(range).is_none());
        lock.unlock_raw(cookie);
        assert!(lock.try_rlock(range).is_some());
    }
}
