//! Insertion-ordered sequence of outstanding requests.
//!
//! Requests live in an arena of reusable slots and are chained into a
//! doubly linked list by slot index, oldest first. A [`Cookie`] names a slot
//! together with the slot's generation; the generation is bumped whenever
//! the slot is freed, so a stale cookie never aliases a newer request.
//!
//! Everything here runs under the owning manager's sequence lock. Nothing
//! in this module blocks or wakes; [`Sequence::rescan`] only collects the
//! wakers of the requests it grants.

use core::fmt;
use std::task::Waker;

use crate::owner::OwnerId;
use crate::range::{LockMode, Range};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Queued behind an earlier conflicting request.
    Pending,
    /// Holds its range.
    Granted,
    /// Unlinked from the sequence. A cookie in this state is dead.
    Released,
}

impl RequestState {
    /// Returns a human-readable string for this state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Opaque handle naming one request in one manager.
///
/// Returned by [`RangeLock::lock_raw`](crate::RangeLock::lock_raw) and
/// required by [`RangeLock::unlock_raw`](crate::RangeLock::unlock_raw).
/// The bits carry no meaning for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(u64);

#[allow(clippy::cast_possible_truncation)]
impl Cookie {
    fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    fn index(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index(), self.generation())
    }
}

/// One outstanding request.
pub(crate) struct Request {
    pub(crate) range: Range,
    pub(crate) mode: LockMode,
    pub(crate) owner: OwnerId,
    pub(crate) state: RequestState,
    /// Wakes the waiter once a rescan grants this request.
    waker: Option<Waker>,
    prev: Option<u32>,
    next: Option<u32>,
}

impl Request {
    /// Returns `true` if the stored waker wakes the same task as `waker`.
    pub(crate) fn will_wake(&self, waker: &Waker) -> bool {
        self.waker.as_ref().is_some_and(|w| w.will_wake(waker))
    }

    /// Stores `waker` and returns the one it replaces, for the caller to
    /// drop outside the sequence lock.
    pub(crate) fn replace_waker(&mut self, waker: Waker) -> Option<Waker> {
        self.waker.replace(waker)
    }
}

struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// The ordered set of all pending and granted requests of one manager.
pub(crate) struct Sequence {
    slots: Vec<Slot>,
    /// Vacant slot indices, reused LIFO.
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    pending: usize,
    /// Set when a request is queued; cleared by the rescan that drains the
    /// last pending request. Releases skip the rescan while it is clear.
    sleepers: bool,
    /// Owners whose own requests do not count as conflicts for them.
    recursing: Vec<OwnerId>,
}

impl Sequence {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            pending: 0,
            sleepers: false,
            recursing: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn sleepers(&self) -> bool {
        self.sleepers
    }

    fn node(&self, index: u32) -> &Request {
        match self.slots[index as usize].request.as_ref() {
            Some(req) => req,
            None => unreachable!("rangelock: linked slot {index} is vacant"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Request {
        match self.slots[index as usize].request.as_mut() {
            Some(req) => req,
            None => unreachable!("rangelock: linked slot {index} is vacant"),
        }
    }

    /// Looks up a live request. Returns `None` for stale or foreign cookies.
    pub(crate) fn get(&self, cookie: Cookie) -> Option<&Request> {
        let slot = self.slots.get(cookie.index() as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        slot.request.as_ref()
    }

    pub(crate) fn get_mut(&mut self, cookie: Cookie) -> Option<&mut Request> {
        let slot = self.slots.get_mut(cookie.index() as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        slot.request.as_mut()
    }

    /// Returns the state of the request named by `cookie`.
    pub(crate) fn state(&self, cookie: Cookie) -> RequestState {
        self.get(cookie)
            .map_or(RequestState::Released, |req| req.state)
    }

    /// Admission test.
    ///
    /// Returns `true` if any request linked before `before` (or any request
    /// at all, for `None`) overlaps `range` in an incompatible mode. When
    /// `owner` is marked recursive, that owner's own requests are skipped,
    /// and so are pending requests that already wait on one of the owner's
    /// grants.
    pub(crate) fn conflicts(
        &self,
        before: Option<u32>,
        range: Range,
        mode: LockMode,
        owner: Option<OwnerId>,
    ) -> bool {
        let recursing = owner.filter(|o| self.recursing.contains(o));
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if Some(index) == before {
                break;
            }
            let req = self.node(index);
            cursor = req.next;
            if !req.range.overlaps(range) || req.mode.is_compatible(mode) {
                continue;
            }
            match recursing {
                Some(o) if o == req.owner => {}
                Some(o) if req.state == RequestState::Pending && self.waits_on(index, o) => {}
                _ => return true,
            }
        }
        false
    }

    /// Returns `true` if a grant of `owner` linked before the pending request
    /// at `index` conflicts with it.
    fn waits_on(&self, index: u32, owner: OwnerId) -> bool {
        let pending = self.node(index);
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if i == index {
                break;
            }
            let req = self.node(i);
            if req.owner == owner
                && req.state == RequestState::Granted
                && req.range.overlaps(pending.range)
                && !req.mode.is_compatible(pending.mode)
            {
                return true;
            }
            cursor = req.next;
        }
        false
    }

    /// Returns `true` if a grant linked after `index` conflicts with the
    /// request there.
    ///
    /// Only a recursive owner's grant can sit behind a conflicting pending
    /// request, so this is the rescan's guard against granting past it.
    fn granted_after(&self, index: u32) -> bool {
        let pending = self.node(index);
        let recursing = Some(pending.owner).filter(|o| self.recursing.contains(o));
        let mut cursor = pending.next;
        while let Some(i) = cursor {
            let req = self.node(i);
            if req.state == RequestState::Granted
                && req.range.overlaps(pending.range)
                && !req.mode.is_compatible(pending.mode)
                && recursing != Some(req.owner)
            {
                return true;
            }
            cursor = req.next;
        }
        false
    }

    /// Links a new request at the tail.
    ///
    /// A `Pending` request also raises the sleepers flag.
    pub(crate) fn insert(
        &mut self,
        range: Range,
        mode: LockMode,
        owner: OwnerId,
        state: RequestState,
        waker: Option<Waker>,
    ) -> Cookie {
        debug_assert_ne!(state, RequestState::Released);

        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            let index = u32::try_from(self.slots.len())
                .unwrap_or_else(|_| panic!("rangelock: too many outstanding requests"));
            self.slots.push(Slot {
                generation: 0,
                request: None,
            });
            index
        };

        let prev = self.tail;
        let slot = &mut self.slots[index as usize];
        slot.request = Some(Request {
            range,
            mode,
            owner,
            state,
            waker,
            prev,
            next: None,
        });
        let cookie = Cookie::new(index, slot.generation);

        match prev {
            Some(p) => self.node_mut(p).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        if state == RequestState::Pending {
            self.pending += 1;
            self.sleepers = true;
        }
        cookie
    }

    /// Unlinks the request named by `cookie` and frees its slot.
    ///
    /// Returns the request, now marked `Released`, or `None` if the cookie
    /// is stale or was never issued by this sequence.
    pub(crate) fn remove(&mut self, cookie: Cookie) -> Option<Request> {
        let index = cookie.index();
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        let mut req = slot.request.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        match req.prev {
            Some(p) => self.node_mut(p).next = req.next,
            None => self.head = req.next,
        }
        match req.next {
            Some(n) => self.node_mut(n).prev = req.prev,
            None => self.tail = req.prev,
        }
        self.len -= 1;
        if req.state == RequestState::Pending {
            self.pending -= 1;
        }
        req.state = RequestState::Released;
        req.prev = None;
        req.next = None;

        if self.recursing.contains(&req.owner) && !self.iter().any(|(_, r)| r.owner == req.owner)
        {
            self.recursing.retain(|o| *o != req.owner);
        }
        Some(req)
    }

    /// Grants every pending request that no earlier outstanding request
    /// conflicts with, in insertion order.
    ///
    /// Wakers of granted requests are pushed to `woken`; the caller wakes
    /// them after dropping the sequence lock. Returns the number granted.
    pub(crate) fn rescan(&mut self, woken: &mut Vec<Waker>) -> usize {
        if !self.sleepers {
            return 0;
        }

        let mut granted = 0;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if self.pending == 0 {
                break;
            }
            let req = self.node(index);
            cursor = req.next;
            if req.state != RequestState::Pending {
                continue;
            }
            let (range, mode, owner) = (req.range, req.mode, req.owner);
            if self.conflicts(Some(index), range, mode, Some(owner))
                || self.granted_after(index)
            {
                continue;
            }

            let req = self.node_mut(index);
            req.state = RequestState::Granted;
            if let Some(waker) = req.waker.take() {
                woken.push(waker);
            }
            self.pending -= 1;
            granted += 1;
        }

        if self.pending == 0 {
            self.sleepers = false;
        }
        granted
    }

    /// Marks `owner` as allowed to overlap its own requests.
    pub(crate) fn may_recurse(&mut self, owner: OwnerId) {
        if !self.recursing.contains(&owner) {
            self.recursing.push(owner);
        }
    }

    /// Removes the recursion mark of `owner`.
    pub(crate) fn clear_recurse(&mut self, owner: OwnerId) {
        self.recursing.retain(|o| *o != owner);
    }

    /// Iterates over outstanding requests, oldest first.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            seq: self,
            cursor: self.head,
        }
    }
}

/// Iterator returned by [`Sequence::iter`].
pub(crate) struct Iter<'a> {
    seq: &'a Sequence,
    cursor: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Cookie, &'a Request);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.seq.slots[index as usize];
        let req = slot.request.as_ref()?;
        self.cursor = req.next;
        Some((Cookie::new(index, slot.generation), req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: OwnerId = OwnerId::new(1);
    const B: OwnerId = OwnerId::new(2);

    fn r(start: u64, end: u64) -> Range {
        Range::new(start, end).unwrap()
    }

    fn grant(seq: &mut Sequence, range: Range, mode: LockMode, owner: OwnerId) -> Cookie {
        seq.insert(range, mode, owner, RequestState::Granted, None)
    }

    fn queue(seq: &mut Sequence, range: Range, mode: LockMode, owner: OwnerId) -> Cookie {
        seq.insert(range, mode, owner, RequestState::Pending, None)
    }

    fn order(seq: &Sequence) -> Vec<Range> {
        seq.iter().map(|(_, req)| req.range).collect()
    }

    #[test]
    fn insert_preserves_order() {
        let mut seq = Sequence::new();
        grant(&mut seq, r(0, 10), LockMode::Read, A);
        grant(&mut seq, r(20, 30), LockMode::Read, A);
        grant(&mut seq, r(40, 50), LockMode::Read, A);
        assert_eq!(order(&seq), [r(0, 10), r(20, 30), r(40, 50)]);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn remove_middle_head_and_tail() {
        let mut seq = Sequence::new();
        let a = grant(&mut seq, r(0, 1), LockMode::Write, A);
        let b = grant(&mut seq, r(1, 2), LockMode::Write, A);
        let c = grant(&mut seq, r(2, 3), LockMode::Write, A);

        assert!(seq.remove(b).is_some());
        assert_eq!(order(&seq), [r(0, 1), r(2, 3)]);
        assert!(seq.remove(a).is_some());
        assert_eq!(order(&seq), [r(2, 3)]);
        assert!(seq.remove(c).is_some());
        assert!(seq.is_empty());
        assert!(seq.iter().next().is_none());
    }

    #[test]
    fn stale_cookie_rejected_after_slot_reuse() {
        let mut seq = Sequence::new();
        let old = grant(&mut seq, r(0, 10), LockMode::Write, A);
        let req = seq.remove(old).unwrap();
        assert_eq!(req.state, RequestState::Released);

        let new = grant(&mut seq, r(0, 10), LockMode::Write, A);
        assert_ne!(old, new);
        assert!(seq.remove(old).is_none());
        assert_eq!(seq.state(old), RequestState::Released);
        assert_eq!(seq.state(new), RequestState::Granted);
    }

    #[test]
    fn conflicts_respect_modes() {
        let mut seq = Sequence::new();
        grant(&mut seq, r(0, 100), LockMode::Read, A);
        assert!(!seq.conflicts(None, r(50, 60), LockMode::Read, Some(B)));
        assert!(seq.conflicts(None, r(50, 60), LockMode::Write, Some(B)));
        assert!(!seq.conflicts(None, r(100, 200), LockMode::Write, Some(B)));
    }

    #[test]
    fn conflicts_only_look_before_cutoff() {
        let mut seq = Sequence::new();
        let first = queue(&mut seq, r(0, 10), LockMode::Write, A);
        grant(&mut seq, r(0, 10), LockMode::Write, B);
        // Nothing precedes the first request.
        assert!(!seq.conflicts(Some(first.index()), r(0, 10), LockMode::Write, Some(A)));
    }

    #[test]
    fn recursion_mark_skips_own_requests() {
        let mut seq = Sequence::new();
        grant(&mut seq, r(0, 10), LockMode::Write, A);
        assert!(seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
        seq.may_recurse(A);
        assert!(!seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
        assert!(seq.conflicts(None, r(0, 10), LockMode::Write, Some(B)));
        seq.clear_recurse(A);
        assert!(seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
    }

    #[test]
    fn recursion_mark_cleared_with_last_request() {
        let mut seq = Sequence::new();
        seq.may_recurse(A);
        let a1 = grant(&mut seq, r(0, 10), LockMode::Write, A);
        let a2 = grant(&mut seq, r(0, 10), LockMode::Write, A);
        seq.remove(a1).unwrap();
        assert!(!seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
        seq.remove(a2).unwrap();
        let _a3 = grant(&mut seq, r(0, 10), LockMode::Write, A);
        assert!(seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
    }

    #[test]
    fn recursive_owner_passes_waiters_queued_on_its_grant() {
        let mut seq = Sequence::new();
        seq.may_recurse(A);
        let outer = grant(&mut seq, r(0, 10), LockMode::Write, A);
        let waiter = queue(&mut seq, r(0, 10), LockMode::Write, B);

        // B waits on A's grant, so it does not hold back A's second lock.
        assert!(!seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
        let inner = grant(&mut seq, r(0, 10), LockMode::Write, A);

        // Releasing the outer grant must not let B past the inner one.
        let mut woken = Vec::new();
        seq.remove(outer).unwrap();
        assert_eq!(seq.rescan(&mut woken), 0);
        assert_eq!(seq.state(waiter), RequestState::Pending);

        seq.remove(inner).unwrap();
        assert_eq!(seq.rescan(&mut woken), 1);
        assert_eq!(seq.state(waiter), RequestState::Granted);
    }

    #[test]
    fn recursive_owner_still_queues_behind_independent_waiters() {
        let mut seq = Sequence::new();
        seq.may_recurse(A);
        grant(&mut seq, r(0, 10), LockMode::Write, A);
        grant(&mut seq, r(20, 30), LockMode::Write, B);
        // Waits on B's grant, not on A's.
        queue(&mut seq, r(15, 25), LockMode::Write, OwnerId::new(3));
        assert!(seq.conflicts(None, r(0, 18), LockMode::Write, Some(A)));
        assert!(!seq.conflicts(None, r(0, 10), LockMode::Write, Some(A)));
    }

    #[test]
    fn unused_recursion_mark_persists_until_cleared() {
        let mut seq = Sequence::new();
        seq.may_recurse(A);
        let b = grant(&mut seq, r(0, 10), LockMode::Write, B);
        seq.remove(b).unwrap();
        assert_eq!(seq.recursing, [A]);
        seq.clear_recurse(A);
        assert!(seq.recursing.is_empty());
    }

    #[test]
    fn rescan_grants_in_order_and_blocks_behind_pending() {
        let mut seq = Sequence::new();
        let holder = grant(&mut seq, r(0, 10), LockMode::Write, A);
        let t2 = queue(&mut seq, r(5, 15), LockMode::Write, B);
        let t3 = queue(&mut seq, r(0, 20), LockMode::Write, OwnerId::new(3));
        let disjoint = queue(&mut seq, r(100, 110), LockMode::Write, OwnerId::new(4));
        assert!(seq.sleepers());

        let mut woken = Vec::new();
        // The disjoint request is granted even though it was queued last.
        assert_eq!(seq.rescan(&mut woken), 1);
        assert_eq!(seq.state(disjoint), RequestState::Granted);
        assert_eq!(seq.state(t2), RequestState::Pending);

        seq.remove(holder).unwrap();
        assert_eq!(seq.rescan(&mut woken), 1);
        assert_eq!(seq.state(t2), RequestState::Granted);
        assert_eq!(seq.state(t3), RequestState::Pending);
        assert!(seq.sleepers());

        seq.remove(t2).unwrap();
        assert_eq!(seq.rescan(&mut woken), 1);
        assert_eq!(seq.state(t3), RequestState::Granted);
        assert!(!seq.sleepers());
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn rescan_skipped_without_sleepers() {
        let mut seq = Sequence::new();
        let a = grant(&mut seq, r(0, 10), LockMode::Write, A);
        seq.remove(a).unwrap();
        let mut woken = Vec::new();
        assert_eq!(seq.rescan(&mut woken), 0);
        assert!(woken.is_empty());
    }

    #[test]
    fn removing_pending_updates_counters() {
        let mut seq = Sequence::new();
        grant(&mut seq, r(0, 10), LockMode::Write, A);
        let p = queue(&mut seq, r(0, 10), LockMode::Read, B);
        assert_eq!(seq.pending(), 1);
        seq.remove(p).unwrap();
        assert_eq!(seq.pending(), 0);
        let mut woken = Vec::new();
        seq.rescan(&mut woken);
        assert!(!seq.sleepers());
    }

    #[test]
    fn cookie_display() {
        let c = Cookie::new(3, 7);
        assert_eq!(c.index(), 3);
        assert_eq!(c.generation(), 7);
        assert_eq!(c.to_string(), "#3.7");
    }
}
