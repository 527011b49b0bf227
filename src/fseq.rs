//! Flow-control sequence counter.
//!
//! An `Fseq` is how a reliable reader tells its producer how far it has
//! safely consumed: the reader stores the next sequence number it expects,
//! and the producer may overwrite any slot older than that. Only the owning
//! reader ever writes the counter; any number of producers read it.
//!
//! Next to the counter sits a small diagnostic region. Each word has a single
//! designated writer as well (the reader for the receive counters, the
//! producer for [`FSEQ_DIAG_SLOW_CNT`]), so updates are plain loads and stores
//! bracketed by compiler fences rather than read-modify-write atomics.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering, compiler_fence};

/// Fragments forwarded downstream.
pub const FSEQ_DIAG_PUB_CNT: usize = 0;
/// Bytes forwarded downstream.
pub const FSEQ_DIAG_PUB_SZ: usize = 1;
/// Fragments filtered.
pub const FSEQ_DIAG_FILT_CNT: usize = 2;
/// Bytes filtered.
pub const FSEQ_DIAG_FILT_SZ: usize = 3;
/// Overruns detected before a fragment was read.
pub const FSEQ_DIAG_OVRNP_CNT: usize = 4;
/// Overruns detected while a fragment was being read.
pub const FSEQ_DIAG_OVRNR_CNT: usize = 5;
/// Times this reader was the slowest one when its producer refreshed credit.
pub const FSEQ_DIAG_SLOW_CNT: usize = 6;

/// Number of diagnostic words in every `Fseq`.
pub const FSEQ_DIAG_WORDS: usize = 8;

/// Copy of an `Fseq` diagnostic region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FseqDiag {
    pub pub_cnt: u64,
    pub pub_sz: u64,
    pub filt_cnt: u64,
    pub filt_sz: u64,
    pub ovrnp_cnt: u64,
    pub ovrnr_cnt: u64,
    pub slow_cnt: u64,
}

#[derive(Debug)]
pub struct Fseq {
    seq: CachePadded<AtomicU64>,
    diag: CachePadded<[AtomicU64; FSEQ_DIAG_WORDS]>,
}

impl Fseq {
    /// Creates a counter at `seq0` with a zeroed diagnostic region.
    ///
    /// `seq0` is normally the first sequence number the producer will
    /// publish, which grants the producer a full ring of credit.
    pub fn new(seq0: u64) -> Self {
        Self {
            seq: CachePadded::new(AtomicU64::new(seq0)),
            diag: CachePadded::new(std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    /// Returns the sequence number the reader expects next.
    #[inline(always)]
    pub fn query(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Publishes a new position. Only the owning reader may call this.
    #[inline(always)]
    pub fn update(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }

    #[inline]
    pub fn diag(&self, idx: usize) -> u64 {
        self.diag[idx].load(Ordering::Relaxed)
    }

    /// Adds `delta` to a diagnostic word. The caller must be that word's
    /// only writer.
    #[inline]
    pub fn diag_add(&self, idx: usize, delta: u64) {
        let word = &self.diag[idx];
        compiler_fence(Ordering::SeqCst);
        word.store(word.load(Ordering::Relaxed).wrapping_add(delta), Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Adds six receive-side accumulators, `[pub_cnt, pub_sz, filt_cnt,
    /// filt_sz, ovrnp_cnt, ovrnr_cnt]`, in one fenced batch.
    #[inline]
    pub fn diag_drain(&self, accum: &[u64; 6]) {
        let diag = &*self.diag;
        let cur: [u64; 6] = std::array::from_fn(|i| diag[i].load(Ordering::Relaxed));
        compiler_fence(Ordering::SeqCst);
        for (i, a) in accum.iter().enumerate() {
            diag[i].store(cur[i].wrapping_add(*a), Ordering::Relaxed);
        }
        compiler_fence(Ordering::SeqCst);
    }

    pub fn diag_snapshot(&self) -> FseqDiag {
        compiler_fence(Ordering::SeqCst);
        let diag = FseqDiag {
            pub_cnt: self.diag(FSEQ_DIAG_PUB_CNT),
            pub_sz: self.diag(FSEQ_DIAG_PUB_SZ),
            filt_cnt: self.diag(FSEQ_DIAG_FILT_CNT),
            filt_sz: self.diag(FSEQ_DIAG_FILT_SZ),
            ovrnp_cnt: self.diag(FSEQ_DIAG_OVRNP_CNT),
            ovrnr_cnt: self.diag(FSEQ_DIAG_OVRNR_CNT),
            slow_cnt: self.diag(FSEQ_DIAG_SLOW_CNT),
        };
        compiler_fence(Ordering::SeqCst);
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_returns_last_update() {
        let fseq = Fseq::new(17);
        assert_eq!(fseq.query(), 17);
        fseq.update(21);
        assert_eq!(fseq.query(), 21);
    }

    #[test]
    fn drain_adds_to_existing_counters() {
        let fseq = Fseq::new(0);
        fseq.diag_drain(&[1, 100, 2, 200, 3, 4]);
        fseq.diag_drain(&[1, 50, 0, 0, 0, 1]);
        fseq.diag_add(FSEQ_DIAG_SLOW_CNT, 7);

        let diag = fseq.diag_snapshot();
        assert_eq!(
            diag,
            FseqDiag {
                pub_cnt: 2,
                pub_sz: 150,
                filt_cnt: 2,
                filt_sz: 200,
                ovrnp_cnt: 3,
                ovrnr_cnt: 5,
                slow_cnt: 7,
            }
        );
    }

    #[test]
    fn diag_words_start_at_zero() {
        let fseq = Fseq::new(0);
        for idx in 0..FSEQ_DIAG_WORDS {
            assert_eq!(fseq.diag(idx), 0, "diag word {} must start at 0", idx);
        }
    }
}
