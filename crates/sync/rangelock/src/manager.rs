//! The range lock manager.
//!
//! [`RangeLock`] serializes overlapping range operations and lets disjoint
//! ones run in parallel. All state lives in one insertion-ordered sequence
//! guarded by a short-held spin lock:
//!
//! ```not_rust
//!   lock(range, mode)
//!          |
//!   any earlier outstanding request
//!   overlapping in an incompatible mode?
//!          |
//!     no---+---yes
//!     |          |
//!  Granted    blocking?
//!  (fast)        |
//!          no----+----yes
//!          |           |
//!      WouldBlock   link as Pending,
//!                   set sleepers, park
//!                      |
//!   unlock ---> unlink, rescan pending in order,
//!               grant + wake the conflict-free ones
//! ```
//!
//! Because a pending request still counts in the admission test, a new
//! request never overtakes an older request it conflicts with: grants among
//! mutually conflicting requests follow insertion order. Requests on
//! disjoint ranges never wait on each other, whatever their order.

use core::fmt;
use std::task::Waker;
use std::thread;
use std::time::{Duration, Instant};

use crate::future::RangeLockFuture;
use crate::guard::RangeGuard;
use crate::owner::OwnerId;
use crate::range::{LockMode, Range};
use crate::sequence::{Cookie, Request, RequestState, Sequence};
use crate::spinlock::SpinLock;
use crate::stat::StatCounters;
use crate::waker::current_thread_waker;

/// Outcome of the admission test.
pub(crate) enum Admission {
    /// Granted on the fast path.
    Granted(Cookie),
    /// Linked as pending; the stored waker fires once a rescan grants it.
    Queued(Cookie),
    /// Conflicting, and the caller asked not to queue.
    WouldBlock,
}

/// A snapshot of one outstanding request, as returned by
/// [`RangeLock::requests`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    /// Handle of the request.
    pub cookie: Cookie,
    /// Locked range.
    pub range: Range,
    /// Requested mode.
    pub mode: LockMode,
    /// `Pending` or `Granted`.
    pub state: RequestState,
    /// Owner that issued the request.
    pub owner: OwnerId,
}

/// Errors from [`RangeLock::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyError {
    /// The manager still had outstanding requests. They were discarded.
    Busy {
        /// Number of requests that were still linked.
        outstanding: usize,
    },
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { outstanding } => {
                write!(f, "range lock destroyed with {outstanding} outstanding request(s)")
            }
        }
    }
}

impl core::error::Error for DestroyError {}

/// A manager of shared and exclusive locks over sub-ranges of a `u64`
/// offset space.
///
/// Create one per protected resource (a file, a buffer) and keep it next to
/// that resource.
///
/// # Example
///
/// ```ignore
/// let lock = RangeLock::named("inode 42");
/// let a = lock.wlock(Range::new(0, 4096)?);
/// let b = lock.wlock(Range::new(4096, 8192)?); // disjoint: granted at once
/// let r = lock.try_rlock(Range::new(0, 10)?);  // overlaps `a`: None
/// ```
///
/// # Recursion
///
/// A thread that locks a range and then requests an overlapping,
/// incompatible range on the same manager deadlocks on itself: its second
/// request queues behind its first. Call [`may_recurse`](Self::may_recurse)
/// to exempt an owner's own requests from its admission test.
pub struct RangeLock {
    seq: SpinLock<Sequence>,
    name: &'static str,
    stats: StatCounters,
}

impl RangeLock {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::named("<unnamed>")
    }

    /// Creates an empty manager with a name used in log messages and dumps.
    pub fn named(name: &'static str) -> Self {
        Self {
            seq: SpinLock::new(Sequence::new()),
            name,
            stats: StatCounters::default(),
        }
    }

    /// Returns the diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    // -----------------------------------------------------------------------
    // Guarded acquisition
    // -----------------------------------------------------------------------

    /// Acquires `range` in `mode` for the calling thread, parking until it
    /// is granted.
    pub fn lock(&self, range: Range, mode: LockMode) -> RangeGuard<'_> {
        self.lock_as(OwnerId::current(), range, mode)
    }

    /// Acquires `range` for shared access, parking until it is granted.
    pub fn rlock(&self, range: Range) -> RangeGuard<'_> {
        self.lock(range, LockMode::Read)
    }

    /// Acquires `range` for exclusive access, parking until it is granted.
    pub fn wlock(&self, range: Range) -> RangeGuard<'_> {
        self.lock(range, LockMode::Write)
    }

    /// Acquires `range` in `mode` on behalf of `owner`.
    pub fn lock_as(&self, owner: OwnerId, range: Range, mode: LockMode) -> RangeGuard<'_> {
        match self.acquire(owner, range, mode, None) {
            Some(cookie) => RangeGuard::new(self, cookie, range, mode),
            None => unreachable!("rangelock: untimed acquisition gave up"),
        }
    }

    /// Tries to acquire `range` in `mode` without parking.
    ///
    /// Returns `None` if an earlier outstanding request conflicts.
    pub fn try_lock(&self, range: Range, mode: LockMode) -> Option<RangeGuard<'_>> {
        self.try_lock_as(OwnerId::current(), range, mode)
    }

    /// Tries to acquire `range` for shared access without parking.
    pub fn try_rlock(&self, range: Range) -> Option<RangeGuard<'_>> {
        self.try_lock(range, LockMode::Read)
    }

    /// Tries to acquire `range` for exclusive access without parking.
    pub fn try_wlock(&self, range: Range) -> Option<RangeGuard<'_>> {
        self.try_lock(range, LockMode::Write)
    }

    /// Tries to acquire `range` in `mode` on behalf of `owner` without
    /// parking.
    pub fn try_lock_as(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
    ) -> Option<RangeGuard<'_>> {
        match self.admit::<fn() -> Waker>(owner, range, mode, None) {
            Admission::Granted(cookie) => Some(RangeGuard::new(self, cookie, range, mode)),
            Admission::Queued(_) | Admission::WouldBlock => None,
        }
    }

    /// Acquires `range` in `mode`, parking for at most `timeout`.
    ///
    /// On timeout the queued request is withdrawn and the pending requests
    /// behind it are re-examined, then `None` is returned. A grant that
    /// races with the timeout wins.
    pub fn lock_timeout(
        &self,
        range: Range,
        mode: LockMode,
        timeout: Duration,
    ) -> Option<RangeGuard<'_>> {
        let deadline = Instant::now().checked_add(timeout);
        self.acquire(OwnerId::current(), range, mode, deadline)
            .map(|cookie| RangeGuard::new(self, cookie, range, mode))
    }

    /// Returns a future that resolves to a guard once `range` is granted.
    ///
    /// Dropping the future before it resolves withdraws the request.
    pub fn lock_async(&self, range: Range, mode: LockMode) -> RangeLockFuture<'_> {
        self.lock_async_as(OwnerId::current(), range, mode)
    }

    /// [`lock_async`](Self::lock_async) on behalf of `owner`.
    pub fn lock_async_as(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
    ) -> RangeLockFuture<'_> {
        RangeLockFuture::new(self, owner, range, mode)
    }

    // -----------------------------------------------------------------------
    // Raw cookie interface
    // -----------------------------------------------------------------------

    /// The unified acquire primitive.
    ///
    /// Returns the cookie of the granted request, or `None` if `blocking`
    /// is false and the request would have to wait. The cookie must be
    /// passed to [`unlock_raw`](Self::unlock_raw) exactly once.
    pub fn lock_raw(&self, range: Range, mode: LockMode, blocking: bool) -> Option<Cookie> {
        self.lock_raw_as(OwnerId::current(), range, mode, blocking)
    }

    /// [`lock_raw`](Self::lock_raw) on behalf of `owner`.
    pub fn lock_raw_as(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
        blocking: bool,
    ) -> Option<Cookie> {
        if blocking {
            self.acquire(owner, range, mode, None)
        } else {
            match self.admit::<fn() -> Waker>(owner, range, mode, None) {
                Admission::Granted(cookie) => Some(cookie),
                Admission::Queued(_) | Admission::WouldBlock => None,
            }
        }
    }

    /// Releases the request named by `cookie` and grants whatever pending
    /// requests that unblocks.
    ///
    /// Unlocking a cookie twice, or a cookie from another manager, is a
    /// caller bug: it panics in debug builds and is logged and ignored
    /// otherwise.
    pub fn unlock_raw(&self, cookie: Cookie) {
        match self.release(cookie) {
            Some((req, _)) => {
                log::trace!("{}: released {} {} ({cookie})", self.name, req.mode, req.range);
            }
            None => self.misuse(cookie),
        }
    }

    // -----------------------------------------------------------------------
    // Recursion control and assertions
    // -----------------------------------------------------------------------

    /// Lets `owner` take locks that overlap its own outstanding requests.
    ///
    /// The mark is dropped when the owner's last request on this manager is
    /// released, or by [`clear_recurse`](Self::clear_recurse). An owner that
    /// marks itself and then never locks keeps its mark until
    /// `clear_recurse` is called. Requests of other owners still conflict as
    /// usual, except that requests already queued behind one of the owner's
    /// grants do not hold back the owner's further requests.
    pub fn may_recurse(&self, owner: OwnerId) {
        self.seq.lock().may_recurse(owner);
        log::debug!("{}: owner {owner} may recurse", self.name);
    }

    /// Removes a mark set by [`may_recurse`](Self::may_recurse).
    pub fn clear_recurse(&self, owner: OwnerId) {
        self.seq.lock().clear_recurse(owner);
    }

    /// Asserts that `cookie` names a granted request whose mode satisfies
    /// `expected`.
    ///
    /// Checked only in debug builds or with `cfg(rangelock_debug)`;
    /// otherwise this is a no-op.
    #[inline]
    #[track_caller]
    pub fn assert_held(&self, cookie: Cookie, expected: LockMode) {
        #[cfg(any(debug_assertions, rangelock_debug))]
        {
            let held = self.seq.lock().get(cookie).map(|req| (req.state, req.mode));
            match held {
                Some((RequestState::Granted, mode)) if mode.satisfies(expected) => {}
                Some((state, mode)) => panic!(
                    "rangelock {}: {cookie} is {state} in {mode} mode, expected a granted {expected} lock",
                    self.name
                ),
                None => panic!(
                    "rangelock {}: {cookie} is not held (expected {expected})",
                    self.name
                ),
            }
        }
        #[cfg(not(any(debug_assertions, rangelock_debug)))]
        let _ = (cookie, expected);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Returns the state of the request named by `cookie`.
    ///
    /// Cookies that were released (or never issued here) report
    /// [`RequestState::Released`].
    pub fn state(&self, cookie: Cookie) -> RequestState {
        self.seq.lock().state(cookie)
    }

    /// Returns the number of outstanding (pending or granted) requests.
    pub fn len(&self) -> usize {
        self.seq.lock().len()
    }

    /// Returns `true` if no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.seq.lock().is_empty()
    }

    /// Returns the number of queued, not yet granted requests.
    pub fn pending(&self) -> usize {
        self.seq.lock().pending()
    }

    /// Returns `true` if some waiter may need a wakeup on release.
    pub fn has_sleepers(&self) -> bool {
        self.seq.lock().sleepers()
    }

    /// Returns `true` if a new request for `range` in `mode` would have to
    /// wait right now.
    pub fn is_locked(&self, range: Range, mode: LockMode) -> bool {
        self.seq.lock().conflicts(None, range, mode, None)
    }

    /// Returns a snapshot of all outstanding requests, oldest first.
    pub fn requests(&self) -> Vec<RequestInfo> {
        self.seq
            .lock()
            .iter()
            .map(|(cookie, req)| RequestInfo {
                cookie,
                range: req.range,
                mode: req.mode,
                state: req.state,
                owner: req.owner,
            })
            .collect()
    }

    /// Writes a human-readable listing of the outstanding requests.
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        let (requests, sleepers) = {
            let seq = self.seq.lock();
            let requests: Vec<_> = seq
                .iter()
                .map(|(cookie, req)| (cookie, req.mode, req.range, req.state, req.owner))
                .collect();
            (requests, seq.sleepers())
        };
        writeln!(
            w,
            "rangelock {}: {} outstanding{}",
            self.name,
            requests.len(),
            if sleepers { ", sleepers" } else { "" }
        )?;
        for (cookie, mode, range, state, owner) in requests {
            writeln!(w, "  {cookie} {mode:<5} {range} {state} owner={owner}")?;
        }
        Ok(())
    }

    /// Returns a snapshot of this manager's contention statistics.
    #[cfg(rangelock_stat)]
    pub fn stats(&self) -> crate::stat::LockStats {
        self.stats.snapshot()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tears the manager down.
    ///
    /// Fails with [`DestroyError::Busy`] if requests are still outstanding;
    /// those requests are discarded and their cookies become meaningless.
    /// Guards borrow the manager, so only leaked raw cookies can trigger
    /// this.
    pub fn destroy(mut self) -> Result<(), DestroyError> {
        let seq = self.seq.get_mut();
        let outstanding = seq.len();
        if outstanding == 0 {
            return Ok(());
        }
        log::warn!(
            "{}: destroyed with {outstanding} outstanding request(s)",
            self.name
        );
        *seq = Sequence::new();
        Err(DestroyError::Busy { outstanding })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Runs the admission test and links the request.
    ///
    /// With `queue = None` a conflicting request is discarded. Otherwise the
    /// waker is built outside the sequence lock and the admission test runs
    /// again with it, linking the request as pending if it still conflicts.
    pub(crate) fn admit<F: FnOnce() -> Waker>(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
        queue: Option<F>,
    ) -> Admission {
        if let Some(admission) = self.link(owner, range, mode, None) {
            return admission;
        }
        let Some(make_waker) = queue else {
            self.stats.record_would_block();
            log::trace!("{}: {mode} {range} for {owner} would block", self.name);
            return Admission::WouldBlock;
        };
        match self.link(owner, range, mode, Some(make_waker())) {
            Some(admission) => admission,
            None => unreachable!("rangelock: request with a waker was not linked"),
        }
    }

    /// Grants the request on the fast path, or links it as pending when a
    /// waker is supplied. Returns `None` on a conflict without a waker.
    fn link(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
        waker: Option<Waker>,
    ) -> Option<Admission> {
        let mut seq = self.seq.lock();
        if !seq.conflicts(None, range, mode, Some(owner)) {
            let cookie = seq.insert(range, mode, owner, RequestState::Granted, None);
            drop(seq);
            self.stats.record_fast_path();
            log::trace!("{}: {mode} {range} granted to {owner} ({cookie})", self.name);
            return Some(Admission::Granted(cookie));
        }

        let waker = waker?;
        let cookie = seq.insert(range, mode, owner, RequestState::Pending, Some(waker));
        drop(seq);
        self.stats.record_contention();
        log::debug!("{}: {mode} {range} for {owner} queued ({cookie})", self.name);
        Some(Admission::Queued(cookie))
    }

    /// Fast path, then park until granted or until `deadline`.
    fn acquire(
        &self,
        owner: OwnerId,
        range: Range,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Option<Cookie> {
        match self.admit(owner, range, mode, Some(current_thread_waker)) {
            Admission::Granted(cookie) => Some(cookie),
            Admission::Queued(cookie) => self.wait(cookie, deadline),
            Admission::WouldBlock => unreachable!("rangelock: blocking admission refused"),
        }
    }

    /// Parks the calling thread until the queued request `cookie` is granted.
    ///
    /// Wakeups may be spurious: the request state is re-read under the
    /// sequence lock after every unpark.
    fn wait(&self, cookie: Cookie, deadline: Option<Instant>) -> Option<Cookie> {
        let queued_at = Instant::now();
        loop {
            let state = self.seq.lock().state(cookie);
            match state {
                RequestState::Granted => {
                    let waited = queued_at.elapsed();
                    self.stats.record_slow_grant(waited);
                    log::debug!("{}: {cookie} granted after {waited:?}", self.name);
                    return Some(cookie);
                }
                RequestState::Pending => {}
                RequestState::Released => {
                    unreachable!("rangelock: queued request {cookie} vanished")
                }
            }

            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.give_up(cookie);
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Withdraws a timed-out request. Returns the cookie if the request was
    /// granted before it could be withdrawn.
    fn give_up(&self, cookie: Cookie) -> Option<Cookie> {
        let mut woken = Vec::new();
        let (granted, req) = {
            let mut seq = self.seq.lock();
            if seq.state(cookie) == RequestState::Granted {
                return Some(cookie);
            }
            let req = seq.remove(cookie);
            (seq.rescan(&mut woken), req)
        };
        self.stats.record_abandoned();
        if let Some(req) = req {
            log::debug!(
                "{}: {} {} for {} timed out, rescan granted {granted}",
                self.name,
                req.mode,
                req.range,
                req.owner
            );
        }
        for waker in woken {
            waker.wake();
        }
        None
    }

    /// Returns the state of a queued request, refreshing its waker while it
    /// is still pending.
    ///
    /// Wakers are cloned and dropped outside the sequence lock.
    pub(crate) fn poll_queued(&self, cookie: Cookie, waker: &Waker) -> RequestState {
        {
            let seq = self.seq.lock();
            match seq.get(cookie) {
                Some(req) if req.state == RequestState::Pending => {
                    if req.will_wake(waker) {
                        return RequestState::Pending;
                    }
                }
                Some(req) => return req.state,
                None => return RequestState::Released,
            }
        }

        let fresh = waker.clone();
        let stale = {
            let mut seq = self.seq.lock();
            match seq.get_mut(cookie) {
                Some(req) if req.state == RequestState::Pending => req.replace_waker(fresh),
                Some(req) => return req.state,
                None => return RequestState::Released,
            }
        };
        drop(stale);
        RequestState::Pending
    }

    /// Withdraws a request whose future was dropped, granted or not.
    ///
    /// A request the rescan already granted counts as an acquisition, not
    /// as abandoned.
    pub(crate) fn abandon(&self, cookie: Cookie, queued_at: Instant) {
        let Some((req, prior)) = self.release(cookie) else {
            return;
        };
        if prior == RequestState::Granted {
            self.stats.record_slow_grant(queued_at.elapsed());
            log::debug!(
                "{}: {} {} for {} released unobserved",
                self.name,
                req.mode,
                req.range,
                req.owner
            );
        } else {
            self.stats.record_abandoned();
            log::debug!(
                "{}: {} {} for {} abandoned",
                self.name,
                req.mode,
                req.range,
                req.owner
            );
        }
    }

    pub(crate) fn record_slow_grant(&self, waited: Duration) {
        self.stats.record_slow_grant(waited);
    }

    /// Unlinks `cookie`, rescans, and wakes whatever the rescan granted.
    ///
    /// Returns the request together with its state before the unlink. The
    /// unlink and the rescan share one critical section, so no request is
    /// granted past a release whose rescan has not run.
    fn release(&self, cookie: Cookie) -> Option<(Request, RequestState)> {
        let mut woken = Vec::new();
        let (req, prior, granted) = {
            let mut seq = self.seq.lock();
            let prior = seq.state(cookie);
            let req = seq.remove(cookie)?;
            let granted = seq.rescan(&mut woken);
            (req, prior, granted)
        };
        if granted != 0 {
            log::debug!(
                "{}: release of {} {} granted {granted} pending request(s)",
                self.name,
                req.mode,
                req.range
            );
        }
        for waker in woken {
            waker.wake();
        }
        Some((req, prior))
    }

    #[cold]
    #[track_caller]
    fn misuse(&self, cookie: Cookie) {
        #[cfg(any(debug_assertions, rangelock_debug))]
        panic!(
            "rangelock {}: unlock of unknown or released cookie {cookie}",
            self.name
        );
        #[cfg(not(any(debug_assertions, rangelock_debug)))]
        log::error!(
            "{}: ignoring unlock of unknown or released cookie {cookie}",
            self.name
        );
    }
}

impl Default for RangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RangeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, pending) = {
            let seq = self.seq.lock();
            (seq.len(), seq.pending())
        };
        f.debug_struct("RangeLock")
            .field("name", &self.name)
            .field("outstanding", &len)
            .field("pending", &pending)
            .finish()
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        let outstanding = self.seq.get_mut().len();
        if outstanding == 0 || thread::panicking() {
            return;
        }
        #[cfg(any(debug_assertions, rangelock_debug))]
        panic!(
            "rangelock {}: dropped with {outstanding} outstanding request(s)",
            self.name
        );
        #[cfg(not(any(debug_assertions, rangelock_debug)))]
        log::error!(
            "{}: dropped with {outstanding} outstanding request(s)",
            self.name
        );
    }
}
