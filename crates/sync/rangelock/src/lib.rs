//! Concurrent range locks.
//!
//! A [`RangeLock`] hands out shared ([`LockMode::Read`]) and exclusive
//! ([`LockMode::Write`]) locks on half-open sub-ranges `[start, end)` of a
//! `u64` offset space, such as the byte ranges of a file. Requests on
//! disjoint ranges never wait on each other; overlapping requests are
//! serialized unless both are reads.
//!
//! ## Fairness
//!
//! Grants are FIFO per conflicting set: among requests that conflict with
//! each other, the one submitted first is granted first, and a later request
//! cannot overtake an earlier queued one it overlaps. Requests that do not
//! conflict are granted in whatever order their ranges free up. There is no
//! global FIFO across unrelated ranges.
//!
//! ## Configuration
//!
//! Behaviour is tuned with `--cfg` flags:
//!
//! - `rangelock_debug`: keep [`RangeLock::assert_held`] and the misuse
//!   panics (double unlock, busy drop) in release builds. They are always on
//!   with `debug_assertions`.
//! - `rangelock_stat`: per-manager contention counters, read with
//!   `RangeLock::stats`.
//! - `rangelock_stress`: random spin delays around every sequence-lock
//!   acquire and release, tuned with `stress::init`.
//! - `loom`: model-check the sequence lock with loom.
//!
//! ## Logging
//!
//! Events are emitted through the [`log`] facade under this crate's target:
//! fast-path grants and releases at `trace`, queueing, rescan grants,
//! timeouts and abandoned requests at `debug`, tolerated misuse at `error`.

#![warn(missing_docs)]

mod future;
mod guard;
mod loom_compat;
mod manager;
mod owner;
mod range;
mod sequence;
mod spinlock;
mod stat;
#[cfg(rangelock_stress)]
pub mod stress;
mod waker;

#[cfg(test)]
pub(crate) mod test_waker;

pub use future::RangeLockFuture;
pub use guard::RangeGuard;
pub use manager::{DestroyError, RangeLock, RequestInfo};
pub use owner::OwnerId;
pub use range::{LockMode, Range, RangeError};
pub use sequence::{Cookie, RequestState};
pub use stat::LockStats;
