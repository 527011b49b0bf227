//! Command-and-control block.
//!
//! A `Cnc` is the small shared region through which a supervisor steers a
//! tile and the tile reports liveness. The supervisor writes the signal; the
//! tile writes the heartbeat and its application diagnostics. Every field has
//! exactly one writer at any moment, so plain loads and stores are enough.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering, compiler_fence};
use std::time::{Duration, Instant};

/// Raw signal values as stored in the control block.
pub const CNC_SIGNAL_RUN: u64 = 0;
pub const CNC_SIGNAL_BOOT: u64 = 1;
pub const CNC_SIGNAL_FAIL: u64 = 2;
pub const CNC_SIGNAL_HALT: u64 = 3;

/// Application signal a supervisor uses to ping the dedup tile. The tile
/// answers by writing `RUN` back.
pub const CNC_SIGNAL_ACK: u64 = 4;

/// App diagnostic word: 1 while the run loop is backpressured.
pub const CNC_DIAG_IN_BACKP: usize = 0;
/// App diagnostic word: transitions into backpressure, accumulated.
pub const CNC_DIAG_BACKP_CNT: usize = 1;

/// Minimum number of app words the dedup tile needs.
pub const CNC_APP_MIN_WORDS: usize = 2;

/// Decoded control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CncSignal {
    Run,
    Boot,
    Fail,
    Halt,
    Ack,
    Other(u64),
}

impl CncSignal {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            CNC_SIGNAL_RUN => CncSignal::Run,
            CNC_SIGNAL_BOOT => CncSignal::Boot,
            CNC_SIGNAL_FAIL => CncSignal::Fail,
            CNC_SIGNAL_HALT => CncSignal::Halt,
            CNC_SIGNAL_ACK => CncSignal::Ack,
            other => CncSignal::Other(other),
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            CncSignal::Run => CNC_SIGNAL_RUN,
            CncSignal::Boot => CNC_SIGNAL_BOOT,
            CncSignal::Fail => CNC_SIGNAL_FAIL,
            CncSignal::Halt => CNC_SIGNAL_HALT,
            CncSignal::Ack => CNC_SIGNAL_ACK,
            CncSignal::Other(raw) => raw,
        }
    }
}

impl fmt::Display for CncSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CncSignal::Run => f.write_str("run"),
            CncSignal::Boot => f.write_str("boot"),
            CncSignal::Fail => f.write_str("fail"),
            CncSignal::Halt => f.write_str("halt"),
            CncSignal::Ack => f.write_str("ack"),
            CncSignal::Other(raw) => write!(f, "{raw}"),
        }
    }
}

/// Copy of the dedup tile's control block diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CncDiag {
    pub heartbeat: i64,
    pub in_backp: u64,
    pub backp_cnt: u64,
}

/// Shared control block.
///
/// Created in the `BOOT` state. A tile refuses to boot on a control block
/// that is in any other state, and puts it back to `BOOT` when it halts.
#[derive(Debug)]
pub struct Cnc {
    signal: CachePadded<AtomicU64>,
    heartbeat: CachePadded<AtomicI64>,
    app: Box<[AtomicU64]>,
}

impl Cnc {
    /// Creates a control block with `app_words` application diagnostic words,
    /// all zero, signal `BOOT`.
    pub fn new(app_words: usize) -> Self {
        let mut app = Vec::with_capacity(app_words);
        app.resize_with(app_words, || AtomicU64::new(0));
        Self {
            signal: CachePadded::new(AtomicU64::new(CNC_SIGNAL_BOOT)),
            heartbeat: CachePadded::new(AtomicI64::new(0)),
            app: app.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn signal_query(&self) -> CncSignal {
        CncSignal::from_raw(self.signal.load(Ordering::Acquire))
    }

    #[inline]
    pub fn signal(&self, signal: CncSignal) {
        self.signal.store(signal.raw(), Ordering::Release);
    }

    #[inline]
    pub fn heartbeat(&self, now: i64) {
        self.heartbeat.store(now, Ordering::Release);
    }

    #[inline]
    pub fn heartbeat_query(&self) -> i64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Number of application diagnostic words.
    pub fn app_words(&self) -> usize {
        self.app.len()
    }

    #[inline]
    pub fn app(&self, idx: usize) -> u64 {
        self.app[idx].load(Ordering::Relaxed)
    }

    /// Overwrites an app word. Only the owning tile may call this.
    #[inline]
    pub fn app_store(&self, idx: usize, value: u64) {
        self.app[idx].store(value, Ordering::Relaxed);
    }

    /// Adds to an app word without a read-modify-write instruction. Only the
    /// owning tile may call this.
    #[inline]
    pub fn app_add(&self, idx: usize, delta: u64) {
        let word = &self.app[idx];
        word.store(word.load(Ordering::Relaxed).wrapping_add(delta), Ordering::Relaxed);
    }

    /// Reads the heartbeat and the dedup diagnostic words.
    ///
    /// # Panics
    ///
    /// Panics if the block has fewer than [`CNC_APP_MIN_WORDS`] app words.
    pub fn diag_snapshot(&self) -> CncDiag {
        compiler_fence(Ordering::SeqCst);
        let diag = CncDiag {
            heartbeat: self.heartbeat_query(),
            in_backp: self.app(CNC_DIAG_IN_BACKP),
            backp_cnt: self.app(CNC_DIAG_BACKP_CNT),
        };
        compiler_fence(Ordering::SeqCst);
        diag
    }

    /// Spins while the signal equals `test`, up to `timeout`.
    ///
    /// Returns the last observed signal, which still equals `test` if the
    /// wait timed out. Intended for supervisors, not for the hot path.
    pub fn wait(&self, test: CncSignal, timeout: Duration) -> CncSignal {
        let deadline = Instant::now() + timeout;
        loop {
            let signal = self.signal_query();
            if signal != test || Instant::now() >= deadline {
                return signal;
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn raw_values_round_trip_through_decoding() {
        for raw in 0..8u64 {
            assert_eq!(CncSignal::from_raw(raw).raw(), raw);
        }
        assert_eq!(CncSignal::from_raw(3), CncSignal::Halt);
        assert_eq!(CncSignal::from_raw(77), CncSignal::Other(77));
    }

    #[test]
    fn display_uses_names_and_falls_back_to_number() {
        assert_eq!(CncSignal::Halt.to_string(), "halt");
        assert_eq!(CncSignal::Ack.to_string(), "ack");
        assert_eq!(CncSignal::Other(42).to_string(), "42");
    }

    #[test]
    fn new_block_starts_in_boot_with_zeroed_app_region() {
        let cnc = Cnc::new(4);
        assert_eq!(cnc.signal_query(), CncSignal::Boot);
        assert_eq!(cnc.app_words(), 4);
        assert_eq!(cnc.diag_snapshot(), CncDiag::default());
    }

    #[test]
    fn app_add_accumulates() {
        let cnc = Cnc::new(CNC_APP_MIN_WORDS);
        cnc.app_add(CNC_DIAG_BACKP_CNT, 2);
        cnc.app_add(CNC_DIAG_BACKP_CNT, 3);
        cnc.app_store(CNC_DIAG_IN_BACKP, 1);
        cnc.heartbeat(1234);
        let diag = cnc.diag_snapshot();
        assert_eq!(diag.backp_cnt, 5);
        assert_eq!(diag.in_backp, 1);
        assert_eq!(diag.heartbeat, 1234);
    }

    #[test]
    fn wait_times_out_when_signal_does_not_change() {
        let cnc = Cnc::new(2);
        let got = cnc.wait(CncSignal::Boot, Duration::from_millis(5));
        assert_eq!(got, CncSignal::Boot);
    }

    #[test]
    fn wait_returns_once_another_thread_changes_signal() {
        let cnc = Arc::new(Cnc::new(2));
        cnc.signal(CncSignal::Halt);
        let writer = {
            let cnc = Arc::clone(&cnc);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(2));
                cnc.signal(CncSignal::Boot);
            })
        };
        let got = cnc.wait(CncSignal::Halt, Duration::from_secs(10));
        writer.join().unwrap();
        assert_eq!(got, CncSignal::Boot);
    }
}
