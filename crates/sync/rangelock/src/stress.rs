//! Lock contention stress delays.
//!
//! Injects random spin delays around sequence-lock acquire/release to widen
//! race windows and surface timing-dependent bugs in the admission and
//! rescan paths. Gated behind `cfg(rangelock_stress)`.
//!
//! ## Design
//!
//! - **PRNG**: xorshift64, per-thread state in a thread-local. No locking.
//! - **Delay**: spins for a random duration in `[0, max_us)` microseconds,
//!   measured with [`Instant`].
//! - **Tuning**: [`init`] sets the ceiling and the seed. Until it is called
//!   the ceiling is 10us and every thread seeds from a fixed constant.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fallback seed, also used to escape the xorshift fixed point at zero.
const FALLBACK_SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Maximum stress delay in microseconds. Set by [`init`].
static MAX_US: AtomicU32 = AtomicU32::new(10);

/// Base seed. Each thread derives its own state from this plus a counter.
static BASE_SEED: AtomicU64 = AtomicU64::new(FALLBACK_SEED);

/// Counter that diverges the per-thread seeds.
static THREAD_SALT: AtomicU64 = AtomicU64::new(0);

std::thread_local! {
    static PRNG_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Initializes the stress delay subsystem.
///
/// - `max_us`: maximum random delay in microseconds. `0` disables delays.
/// - `seed`: base PRNG seed. If 0, a fallback constant is used to avoid a
///   stuck-at-zero xorshift.
pub fn init(max_us: u32, seed: u64) {
    MAX_US.store(max_us, Ordering::Relaxed);
    BASE_SEED.store(if seed == 0 { FALLBACK_SEED } else { seed }, Ordering::Relaxed);
}

/// Returns the next pseudo-random u64 for the current thread.
#[inline]
fn next_random() -> u64 {
    PRNG_STATE.with(|state| {
        let mut x = state.get();
        if x == 0 {
            let salt = THREAD_SALT.fetch_add(1, Ordering::Relaxed);
            x = BASE_SEED
                .load(Ordering::Relaxed)
                .wrapping_add(salt)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15);
            if x == 0 {
                x = FALLBACK_SEED;
            }
        }
        // xorshift64
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

/// Spins for a random duration in `[0, max_us)` microseconds.
///
/// Must not touch any range lock: it runs inside the sequence-lock
/// acquire and release paths.
#[inline]
pub fn stress_delay() {
    let max_us = MAX_US.load(Ordering::Relaxed);
    if max_us == 0 {
        return;
    }

    let target_ns = next_random() % (u64::from(max_us) * 1000);
    if target_ns == 0 {
        return;
    }

    let target = Duration::from_nanos(target_ns);
    let start = Instant::now();
    while start.elapsed() < target {
        core::hint::spin_loop();
    }
}
