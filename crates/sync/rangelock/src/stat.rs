//! Per-manager lock contention statistics.
//!
//! Behind `cfg(rangelock_stat)` every [`RangeLock`](crate::RangeLock) keeps
//! atomic counters of how its requests were resolved. Without the flag the
//! counters are a zero-sized type whose methods compile to nothing.

#[cfg(rangelock_stat)]
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of a manager's statistics, returned by
/// [`RangeLock::stats`](crate::RangeLock::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Requests granted, on either path.
    pub acquisitions: u64,
    /// Requests granted without suspending the caller.
    pub fast_path: u64,
    /// Requests that had to queue behind a conflicting request.
    pub contentions: u64,
    /// Non-blocking requests refused because of a conflict.
    pub would_block: u64,
    /// Queued requests abandoned by a timeout or a dropped future.
    pub abandoned: u64,
    /// Cumulative time queued requests spent waiting, in nanoseconds.
    pub total_wait_ns: u64,
    /// Longest time a queued request spent waiting, in nanoseconds.
    pub max_wait_ns: u64,
}

#[cfg(rangelock_stat)]
#[derive(Default)]
pub(crate) struct StatCounters {
    acquisitions: AtomicU64,
    fast_path: AtomicU64,
    contentions: AtomicU64,
    would_block: AtomicU64,
    abandoned: AtomicU64,
    total_wait_ns: AtomicU64,
    max_wait_ns: AtomicU64,
}

#[cfg(rangelock_stat)]
impl StatCounters {
    pub(crate) fn record_fast_path(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.fast_path.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_contention(&self) {
        self.contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_would_block(&self) {
        self.would_block.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slow_grant(&self, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let ns = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.total_wait_ns.fetch_add(ns, Ordering::Relaxed);
        // Relaxed max update: may race, but close enough for stats.
        let mut cur = self.max_wait_ns.load(Ordering::Relaxed);
        while ns > cur {
            match self.max_wait_ns.compare_exchange_weak(
                cur,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            total_wait_ns: self.total_wait_ns.load(Ordering::Relaxed),
            max_wait_ns: self.max_wait_ns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(not(rangelock_stat))]
#[derive(Default)]
pub(crate) struct StatCounters;

#[cfg(not(rangelock_stat))]
#[allow(clippy::unused_self)]
impl StatCounters {
    #[inline(always)]
    pub(crate) fn record_fast_path(&self) {}

    #[inline(always)]
    pub(crate) fn record_contention(&self) {}

    #[inline(always)]
    pub(crate) fn record_would_block(&self) {}

    #[inline(always)]
    pub(crate) fn record_abandoned(&self) {}

    #[inline(always)]
    pub(crate) fn record_slow_grant(&self, _waited: Duration) {}
}

impl LockStats {
    /// Writes the statistics as a single human-readable line.
    pub fn dump(&self, w: &mut impl core::fmt::Write) -> core::fmt::Result {
        let avg_wait_ns = self
            .total_wait_ns
            .checked_div(self.contentions.saturating_sub(self.abandoned))
            .unwrap_or(0);
        writeln!(
            w,
            "acq={} fast={} contended={} would_block={} abandoned={} avg_wait={}ns max_wait={}ns",
            self.acquisitions,
            self.fast_path,
            self.contentions,
            self.would_block,
            self.abandoned,
            avg_wait_ns,
            self.max_wait_ns,
        )
    }
}

#[cfg(all(test, rangelock_stat))]
mod tests {
    use super::*;

    #[test]
    fn max_wait_tracks_largest() {
        let stats = StatCounters::default();
        stats.record_contention();
        stats.record_slow_grant(Duration::from_nanos(500));
        stats.record_contention();
        stats.record_slow_grant(Duration::from_nanos(200));
        let snap = stats.snapshot();
        assert_eq!(snap.acquisitions, 2);
        assert_eq!(snap.max_wait_ns, 500);
        assert_eq!(snap.total_wait_ns, 700);
    }
}
