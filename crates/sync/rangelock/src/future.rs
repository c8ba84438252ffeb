//! Async range acquisition.
//!
//! [`RangeLockFuture`] runs the same admission test as the blocking path,
//! but a queued request stores the polling task's [`Waker`] instead of
//! parking a thread. The rescan that grants the request wakes the task.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Instant;

use crate::guard::RangeGuard;
use crate::manager::{Admission, RangeLock};
use crate::owner::OwnerId;
use crate::range::{LockMode, Range};
use crate::sequence::{Cookie, RequestState};

enum Stage {
    /// Not yet submitted to the manager.
    Idle,
    /// Linked as pending since the given instant.
    Queued(Cookie, Instant),
    /// The guard has been handed out.
    Done,
}

/// Future returned by [`RangeLock::lock_async`].
///
/// Dropping the future while its request is queued withdraws the request
/// and re-examines the requests queued behind it.
#[must_use = "futures do nothing unless polled"]
pub struct RangeLockFuture<'a> {
    lock: &'a RangeLock,
    owner: OwnerId,
    range: Range,
    mode: LockMode,
    stage: Stage,
}

impl<'a> RangeLockFuture<'a> {
    pub(crate) fn new(lock: &'a RangeLock, owner: OwnerId, range: Range, mode: LockMode) -> Self {
        Self {
            lock,
            owner,
            range,
            mode,
            stage: Stage::Idle,
        }
    }
}

impl<'a> Future for RangeLockFuture<'a> {
    type Output = RangeGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let lock = this.lock;

        match this.stage {
            Stage::Idle => {
                let waker = || cx.waker().clone();
                match lock.admit(this.owner, this.range, this.mode, Some(waker)) {
                    Admission::Granted(cookie) => {
                        this.stage = Stage::Done;
                        Poll::Ready(RangeGuard::new(lock, cookie, this.range, this.mode))
                    }
                    Admission::Queued(cookie) => {
                        this.stage = Stage::Queued(cookie, Instant::now());
                        Poll::Pending
                    }
                    Admission::WouldBlock => {
                        unreachable!("rangelock: queueing admission refused")
                    }
                }
            }
            Stage::Queued(cookie, queued_at) => match lock.poll_queued(cookie, cx.waker()) {
                RequestState::Granted => {
                    this.stage = Stage::Done;
                    lock.record_slow_grant(queued_at.elapsed());
                    Poll::Ready(RangeGuard::new(lock, cookie, this.range, this.mode))
                }
                RequestState::Pending => Poll::Pending,
                RequestState::Released => {
                    unreachable!("rangelock: queued request {cookie} vanished")
                }
            },
            Stage::Done => panic!("RangeLockFuture polled after completion"),
        }
    }
}

impl Drop for RangeLockFuture<'_> {
    fn drop(&mut self) {
        if let Stage::Queued(cookie, queued_at) = self.stage {
            self.lock.abandon(cookie, queued_at);
        }
    }
}
