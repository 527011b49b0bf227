//! Clocks and housekeeping interval derivation.

use crate::error::{Error, Result};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of ticks for the run loop.
///
/// Ticks are opaque: the tile only compares and adds them. `tick_per_ns` in
/// [`crate::TileConfig`] tells it how ticks relate to nanoseconds.
pub trait Clock {
    fn now(&self) -> i64;
}

/// Monotonic clock in nanoseconds (`CLOCK_MONOTONIC`).
#[derive(Debug, Default, Clone, Copy)]
pub struct MonoClock;

impl Clock for MonoClock {
    #[inline(always)]
    fn now(&self) -> i64 {
        mono_time_ns()
    }
}

/// Returns timestamp in ns
#[inline(never)]
pub fn mono_time_ns() -> i64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, exclusively borrowed timespec.
    unsafe {
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as i64) * 1_000_000_000 + (ts.tv_nsec as i64)
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    #[cfg(test)]
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, ticks: i64) {
        self.now.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Default housekeeping interval in ns for a given credit budget.
///
/// Roughly the time a consumer needs to drain `cr_max` fragments at a couple
/// of ns each, so credit comes back about as fast as it can be used.
pub fn lazy_default(cr_max: u64) -> i64 {
    let lazy = 1u64.saturating_add(cr_max.saturating_mul(9) / 4);
    i64::try_from(lazy).unwrap_or(i64::MAX)
}

/// Minimum tick spacing between housekeeping events so that a full cycle of
/// `event_cnt` events takes about `lazy` ns.
///
/// The result is rounded down to a power of two so jitter can be drawn with
/// a mask.
///
/// # Errors
///
/// [`Error::BadLazy`] unless `lazy` and `event_cnt` are in `[1, 2^31)`,
/// `tick_per_ns` is in `(0, 1e9]`, and the spacing is at least one tick.
pub fn async_min(lazy: i64, event_cnt: usize, tick_per_ns: f64) -> Result<u64> {
    let bad = || Error::BadLazy {
        lazy,
        event_cnt,
        tick_per_ns,
    };
    if !(1..(1i64 << 31)).contains(&lazy) {
        return Err(bad());
    }
    if !(1..(1usize << 31)).contains(&event_cnt) {
        return Err(bad());
    }
    if !(tick_per_ns > 0.0 && tick_per_ns <= 1e9) {
        return Err(bad());
    }
    let target = (tick_per_ns * lazy as f64 / event_cnt as f64) as u64;
    if target == 0 {
        return Err(bad());
    }
    Ok(1u64 << (63 - target.leading_zeros()))
}

/// Draws the next housekeeping spacing, uniform in
/// `[async_min, 2 * async_min)`.
///
/// `async_min` must be a power of two.
#[inline]
pub fn async_reload<R: RngCore>(rng: &mut R, async_min: u64) -> i64 {
    debug_assert!(async_min.is_power_of_two());
    (async_min + (rng.next_u64() & (async_min - 1))) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn lazy_default_scales_with_credit() {
        assert_eq!(lazy_default(0), 1);
        assert_eq!(lazy_default(4), 10);
        assert_eq!(lazy_default(1024), 2305);
        assert_eq!(lazy_default(u64::MAX), (u64::MAX / 4 + 1) as i64);
    }

    #[test]
    fn async_min_rounds_down_to_power_of_two() {
        assert_eq!(async_min(10, 3, 1.0), Ok(2));
        assert_eq!(async_min(1_000, 1, 1.0), Ok(512));
        assert_eq!(async_min(1_000, 1, 3.0), Ok(2048));
        assert_eq!(async_min(1, 1, 1.0), Ok(1));
    }

    #[test]
    fn async_min_rejects_out_of_range_inputs() {
        assert!(async_min(0, 3, 1.0).is_err());
        assert!(async_min(1i64 << 31, 3, 1.0).is_err());
        assert!(async_min(10, 0, 1.0).is_err());
        assert!(async_min(10, 3, 0.0).is_err());
        assert!(async_min(10, 3, f64::NAN).is_err());
        assert!(async_min(10, 3, 2e9).is_err());
        assert!(async_min(2, 3, 1.0).is_err(), "less than one tick per event");
    }

    #[test]
    fn reload_stays_within_one_octave() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let r = async_reload(&mut rng, 64);
            assert!((64..128).contains(&r), "reload {} out of range", r);
        }
        assert_eq!(async_reload(&mut rng, 1), 1);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(5);
        let other = clock.clone();
        clock.advance(10);
        assert_eq!(other.now(), 15);
        other.set(100);
        assert_eq!(clock.now(), 100);
    }

    #[test]
    fn mono_clock_does_not_go_backwards() {
        let a = MonoClock.now();
        let b = MonoClock.now();
        assert!(b >= a);
    }
}
