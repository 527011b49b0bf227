use crate::fseq::Fseq;
use crate::seq::{seq_dec, seq_diff, seq_inc};
use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, fence};

/// Fragment metadata as seen by a reader.
///
/// This is a plain copy of one ring slot. The payload itself lives elsewhere
/// and is referenced by `chunk`; the ring only carries the 32 bytes of
/// metadata needed to route, filter and account for a fragment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FragMeta {
    /// Sequence number of the fragment within its producer's stream.
    pub seq: u64,
    /// Fingerprint used for duplicate detection.
    pub sig: u64,
    /// Opaque payload reference.
    pub chunk: u32,
    /// Payload size in bytes.
    pub sz: u16,
    /// Application control bits.
    pub ctl: u16,
    /// Compressed timestamp of when the fragment entered the pipeline.
    pub tsorig: u32,
    /// Compressed timestamp of when this producer published it.
    pub tspub: u32,
}

/// One ring slot.
///
/// Every field is an atomic so that concurrent reads of a slot that is being
/// rewritten are well defined; the sequence stamp protocol decides whether
/// what was read is usable.
#[derive(Debug, Default)]
#[repr(C, align(32))]
struct Line {
    seq: AtomicU64,
    sig: AtomicU64,
    chunk: AtomicU32,
    sz: AtomicU16,
    ctl: AtomicU16,
    tsorig: AtomicU32,
    tspub: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<Line>() == 32);

/// Outcome of polling a ring slot for an expected sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragPoll {
    /// The fragment was read and verified unchanged after the read.
    Ready(FragMeta),
    /// The slot still holds an older fragment; nothing new yet.
    CaughtUp,
    /// The producer already lapped the reader; carries the sequence found in
    /// the slot.
    Overrun(u64),
    /// The slot was overwritten while being read; carries the sequence found
    /// on the re-check.
    Torn(u64),
}

/// Fragment metadata ring ("mcache").
///
/// A power-of-two array of slots plus a `sync` word. Sequence number `seq`
/// lives at slot `seq & (depth - 1)`. A single producer publishes into the
/// ring; any number of readers poll it, each tracking its own expected
/// sequence number.
///
/// # Publication protocol
///
/// To publish `seq` the producer:
///
/// 1. stores `seq - 1` into the slot's stamp, so the slot no longer matches
///    any sequence a reader could be waiting for,
/// 2. writes the metadata fields,
/// 3. stores `seq` into the stamp with release ordering.
///
/// A reader loads the stamp with acquire ordering, and only if it equals the
/// expected sequence reads the fields and then re-reads the stamp. An
/// unchanged stamp proves the fields belong to that sequence.
///
/// # Sync word
///
/// `sync` is where the producer advertises its next sequence number for
/// readers that join a stream that is already running. It is updated lazily
/// (for example during housekeeping), so it may lag slightly.
#[derive(Debug)]
pub struct MCache {
    sync: CachePadded<AtomicU64>,
    lines: Box<[Line]>,
    depth: usize,
    depth_mask: usize,
}

impl MCache {
    /// Creates a ring whose first published sequence number will be `seq0`.
    ///
    /// The requested `depth` is rounded up to the next power of two, with a
    /// minimum of `2`. Every slot is stamped `seq0 - 1`, so readers that start
    /// at `seq0` see the ring as caught up.
    pub fn new(depth: usize, seq0: u64) -> Arc<Self> {
        let depth = depth.max(2).next_power_of_two();
        let mut v: Vec<Line> = Vec::with_capacity(depth);
        v.resize_with(depth, Line::default);
        let stamp = seq_dec(seq0, 1);
        for line in v.iter() {
            line.seq.store(stamp, Ordering::Relaxed);
        }
        Arc::new(Self {
            sync: CachePadded::new(AtomicU64::new(seq0)),
            lines: v.into_boxed_slice(),
            depth,
            depth_mask: depth - 1,
        })
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Slot index of `seq`.
    #[inline(always)]
    pub fn line_idx(&self, seq: u64) -> usize {
        seq as usize & self.depth_mask
    }

    /// Reads the advertised next sequence number.
    #[inline]
    pub fn seq_query(&self) -> u64 {
        self.sync.load(Ordering::Acquire)
    }

    /// Advertises the producer's next sequence number. Producer only.
    #[inline]
    pub fn seq_update(&self, seq: u64) {
        self.sync.store(seq, Ordering::Release);
    }

    /// Publishes `meta` at `meta.seq`. Producer only.
    ///
    /// There is no backpressure at this level: the slot is overwritten
    /// unconditionally. Honoring reader credit is the caller's job (see
    /// [`Sender`]).
    #[inline(always)]
    pub fn publish(&self, meta: &FragMeta) {
        let line = &self.lines[self.line_idx(meta.seq)];
        line.seq.store(seq_dec(meta.seq, 1), Ordering::Relaxed);
        fence(Ordering::Release);
        line.sig.store(meta.sig, Ordering::Relaxed);
        line.chunk.store(meta.chunk, Ordering::Relaxed);
        line.sz.store(meta.sz, Ordering::Relaxed);
        line.ctl.store(meta.ctl, Ordering::Relaxed);
        line.tsorig.store(meta.tsorig, Ordering::Relaxed);
        line.tspub.store(meta.tspub, Ordering::Relaxed);
        line.seq.store(meta.seq, Ordering::Release);
    }

    /// Polls slot `line` for sequence number `seq`.
    ///
    /// `line` must be `self.line_idx(seq)`; readers cache it next to their
    /// expected sequence number.
    ///
    /// On [`FragPoll::Overrun`] and [`FragPoll::Torn`] the returned sequence
    /// number may be the invalidation stamp of a write in progress (`seq - 1`
    /// of the fragment being written), which lives in a different slot.
    /// Readers resuming from it must recompute their slot index.
    #[inline(always)]
    pub fn poll(&self, line: usize, seq: u64) -> FragPoll {
        debug_assert_eq!(line, self.line_idx(seq));
        let slot = &self.lines[line];

        let seq_found = slot.seq.load(Ordering::Acquire);
        let diff = seq_diff(seq, seq_found);
        if diff != 0 {
            return if diff < 0 {
                FragPoll::Overrun(seq_found)
            } else {
                FragPoll::CaughtUp
            };
        }

        let meta = FragMeta {
            seq: seq_found,
            sig: slot.sig.load(Ordering::Relaxed),
            chunk: slot.chunk.load(Ordering::Relaxed),
            sz: slot.sz.load(Ordering::Relaxed),
            ctl: slot.ctl.load(Ordering::Relaxed),
            tsorig: slot.tsorig.load(Ordering::Relaxed),
            tspub: slot.tspub.load(Ordering::Relaxed),
        };
        fence(Ordering::Acquire);
        let seq_test = slot.seq.load(Ordering::Relaxed);
        if seq_test != seq_found {
            return FragPoll::Torn(seq_test);
        }
        FragPoll::Ready(meta)
    }

    /// Convenience form of [`MCache::poll`] that computes the slot index.
    #[inline]
    pub fn query(&self, seq: u64) -> FragPoll {
        self.poll(self.line_idx(seq), seq)
    }
}

/// Compresses a tick count to the 32 bits carried in a ring slot.
#[inline(always)]
pub fn ts_comp(ts: i64) -> u32 {
    ts as u32
}

/// Recovers a full tick count from a compressed one, given a reference tick
/// count within about 2^31 ticks of the original.
#[inline]
pub fn ts_decomp(tscomp: u32, tsref: i64) -> i64 {
    let msb = (tsref as u64)
        .wrapping_add((1u64 << 31) - 1)
        .wrapping_sub(tscomp as u64);
    ((msb & !0xFFFF_FFFFu64) | tscomp as u64) as i64
}

/// Producer handle that only publishes while its reliable readers grant
/// credit.
///
/// A reliable reader reports its progress through an [`Fseq`]. The sender
/// may have at most `cr_max` fragments in flight past the slowest reader, so
/// with `cr_max <= depth` no reliable reader is ever overrun.
///
/// The `Sender` is intentionally **not `Clone`**: one ring, one producer.
#[derive(Debug)]
pub struct Sender {
    mcache: Arc<MCache>,
    seq: u64,
    fseqs: Vec<Arc<Fseq>>,
    cr_max: u64,
}

impl Sender {
    /// Creates a sender that resumes at the ring's advertised sequence
    /// number, with `cr_max` equal to the ring depth.
    pub fn new(mcache: Arc<MCache>, fseqs: Vec<Arc<Fseq>>) -> Self {
        let cr_max = mcache.depth() as u64;
        Self::with_cr_max(mcache, fseqs, cr_max)
    }

    /// Same as [`Sender::new`] with an explicit in-flight limit.
    ///
    /// # Panics
    ///
    /// Panics if `cr_max` is zero or exceeds the ring depth.
    pub fn with_cr_max(mcache: Arc<MCache>, fseqs: Vec<Arc<Fseq>>, cr_max: u64) -> Self {
        assert!(
            cr_max >= 1 && cr_max <= mcache.depth() as u64,
            "cr_max must be in [1, depth]"
        );
        let seq = mcache.seq_query();
        Self {
            mcache,
            seq,
            fseqs,
            cr_max,
        }
    }

    /// Sequence number the next fragment will get.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Credits currently granted by the slowest reliable reader.
    #[inline]
    pub fn credits(&self) -> u64 {
        let mut cr_avail = self.cr_max;
        for fseq in &self.fseqs {
            let lag = seq_diff(self.seq, fseq.query()).max(0) as u64;
            cr_avail = cr_avail.min(self.cr_max.saturating_sub(lag));
        }
        cr_avail
    }

    /// Publishes one fragment if credit is available.
    ///
    /// Returns the fragment's sequence number, or `None` if the sender is
    /// backpressured. `tspub` is stamped with `tsorig`; tiles downstream
    /// restamp it when they republish.
    #[inline]
    pub fn try_send(&mut self, sig: u64, chunk: u32, sz: u16, ctl: u16, tsorig: u32) -> Option<u64> {
        if self.credits() == 0 {
            return None;
        }
        let seq = self.seq;
        self.mcache.publish(&FragMeta {
            seq,
            sig,
            chunk,
            sz,
            ctl,
            tsorig,
            tspub: tsorig,
        });
        self.seq = seq_inc(seq, 1);
        self.mcache.seq_update(self.seq);
        Some(seq)
    }

    /// Spin-waits for credit, then publishes.
    #[inline]
    pub fn send(&mut self, sig: u64, chunk: u32, sz: u16, ctl: u16, tsorig: u32) -> u64 {
        loop {
            if let Some(seq) = self.try_send(sig, chunk, sz, ctl, tsorig) {
                return seq;
            }
            core::hint::spin_loop();
        }
    }
}

/// Reliable reader handle.
///
/// Reads fragments in order and reports progress through its [`Fseq`], which
/// is what grants its producer credit. It never blocks the producer beyond
/// what it acknowledges.
///
/// # Overwrite detection
///
/// If the reader falls behind and its slot is overwritten (impossible if the
/// producer honors this reader's credit), it resynchronizes to the sequence
/// number found in the slot and counts the loss.
#[derive(Debug)]
pub struct Receiver {
    mcache: Arc<MCache>,
    seq: u64,
    line: usize,
    fseq: Arc<Fseq>,
    overrun_cnt: u64,
}

impl Receiver {
    /// Creates a receiver that starts at the ring's advertised sequence
    /// number and reports through `fseq`.
    pub fn new(mcache: Arc<MCache>, fseq: Arc<Fseq>) -> Self {
        let seq = mcache.seq_query();
        let line = mcache.line_idx(seq);
        Self {
            mcache,
            seq,
            line,
            fseq,
            overrun_cnt: 0,
        }
    }

    /// Sequence number this receiver expects next.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of overruns observed so far.
    #[inline]
    pub fn overrun_cnt(&self) -> u64 {
        self.overrun_cnt
    }

    /// Non-blocking receive.
    ///
    /// Returns the next fragment if it is ready. Overruns are resolved
    /// internally (counted, then resynchronized) and reported as `None`.
    /// Call [`Receiver::ack`] to release credit to the producer.
    #[inline]
    pub fn try_recv(&mut self) -> Option<FragMeta> {
        match self.mcache.poll(self.line, self.seq) {
            FragPoll::Ready(meta) => {
                self.seq = seq_inc(self.seq, 1);
                self.line = self.mcache.line_idx(self.seq);
                Some(meta)
            }
            FragPoll::CaughtUp => None,
            FragPoll::Overrun(seq) | FragPoll::Torn(seq) => {
                self.overrun_cnt += 1;
                self.seq = seq;
                self.line = self.mcache.line_idx(seq);
                None
            }
        }
    }

    /// Blocking receive: spin-waits for the next fragment.
    #[inline]
    pub fn recv(&mut self) -> FragMeta {
        loop {
            if let Some(meta) = self.try_recv() {
                return meta;
            }
            core::hint::spin_loop();
        }
    }

    /// Reports everything before [`Receiver::seq`] as consumed.
    #[inline]
    pub fn ack(&self) {
        self.fseq.update(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(seq: u64, sig: u64) -> FragMeta {
        FragMeta {
            seq,
            sig,
            chunk: seq as u32,
            sz: 64,
            ctl: 3,
            tsorig: 11,
            tspub: 12,
        }
    }

    #[test]
    fn new_rounds_depth_up_to_power_of_two() {
        assert_eq!(MCache::new(5, 0).depth(), 8);
        assert_eq!(MCache::new(0, 0).depth(), 2);
        assert_eq!(MCache::new(16, 0).depth(), 16);
    }

    #[test]
    fn fresh_ring_is_caught_up_at_seq0() {
        let mcache = MCache::new(8, 100);
        assert_eq!(mcache.seq_query(), 100);
        for seq in 100..108 {
            assert_eq!(mcache.query(seq), FragPoll::CaughtUp, "seq {}", seq);
        }
    }

    #[test]
    fn publish_then_poll_returns_metadata() {
        let mcache = MCache::new(8, 0);
        mcache.publish(&frag(0, 0xA));
        mcache.publish(&frag(1, 0xB));

        assert_eq!(mcache.query(0), FragPoll::Ready(frag(0, 0xA)));
        assert_eq!(mcache.query(1), FragPoll::Ready(frag(1, 0xB)));
        assert_eq!(mcache.query(2), FragPoll::CaughtUp);
    }

    #[test]
    fn lapped_reader_sees_overrun_with_same_line() {
        let mcache = MCache::new(4, 0);
        for seq in 0..6 {
            mcache.publish(&frag(seq, seq + 1));
        }
        // Slot 0 now holds seq 4, slot 1 holds seq 5.
        assert_eq!(mcache.query(0), FragPoll::Overrun(4));
        assert_eq!(mcache.line_idx(4), mcache.line_idx(0));
        assert_eq!(mcache.query(1), FragPoll::Overrun(5));
        // Slot 2 still holds seq 2.
        assert_eq!(mcache.query(2), FragPoll::Ready(frag(2, 3)));
    }

    #[test]
    fn write_in_progress_reports_stamp_of_another_line() {
        let mcache = MCache::new(8, 0);
        mcache.publish(&frag(0, 0xA));
        mcache.publish(&frag(1, 0xB));
        // Producer lapping to seq 9 has only invalidated slot 1 so far.
        mcache.lines[1].seq.store(8, Ordering::Relaxed);
        assert_eq!(mcache.query(1), FragPoll::Overrun(8));
        assert_ne!(mcache.line_idx(8), mcache.line_idx(1));

        let mut rx = Receiver::new(Arc::clone(&mcache), Arc::new(Fseq::new(0)));
        assert_eq!(rx.try_recv(), Some(frag(0, 0xA)));
        assert_eq!(rx.try_recv(), None);
        assert_eq!((rx.seq(), rx.overrun_cnt()), (8, 1));
        assert_eq!(rx.try_recv(), None, "slot 0 still holds seq 0");
        mcache.publish(&frag(8, 0xC));
        assert_eq!(rx.try_recv(), Some(frag(8, 0xC)));
    }

    #[test]
    fn ts_decomp_recovers_nearby_timestamps() {
        let ts: i64 = 0x1234_5678_9ABC;
        assert_eq!(ts_decomp(ts_comp(ts), ts), ts);
        assert_eq!(ts_decomp(ts_comp(ts), ts + 1_000), ts);
        assert_eq!(ts_decomp(ts_comp(ts), ts - 1_000), ts);
        // Across a 32-bit boundary.
        let ts: i64 = 0x2_0000_0010;
        assert_eq!(ts_decomp(ts_comp(ts), 0x1_FFFF_FFF0), ts);
    }

    // --- Sender / Receiver ---------------------------------------------------

    #[test]
    fn sender_stops_when_reader_withholds_credit() {
        let mcache = MCache::new(4, 0);
        let fseq = Arc::new(Fseq::new(0));
        let mut tx = Sender::new(Arc::clone(&mcache), vec![Arc::clone(&fseq)]);

        for i in 0..4 {
            assert_eq!(tx.try_send(i + 1, 0, 8, 0, 0), Some(i));
        }
        assert_eq!(tx.credits(), 0);
        assert_eq!(tx.try_send(99, 0, 8, 0, 0), None, "no credit left");
        assert_eq!(mcache.seq_query(), 4);

        fseq.update(2);
        assert_eq!(tx.credits(), 2);
        assert_eq!(tx.try_send(5, 0, 8, 0, 0), Some(4));
    }

    #[test]
    fn sender_credit_follows_slowest_reader() {
        let mcache = MCache::new(8, 0);
        let fast = Arc::new(Fseq::new(0));
        let slow = Arc::new(Fseq::new(0));
        let mut tx = Sender::with_cr_max(
            Arc::clone(&mcache),
            vec![Arc::clone(&fast), Arc::clone(&slow)],
            4,
        );
        for i in 0..3 {
            tx.send(i + 1, 0, 1, 0, 0);
        }
        fast.update(3);
        assert_eq!(tx.credits(), 1, "slow reader still owes 3 of 4 credits");
    }

    #[test]
    fn receiver_reads_in_order_and_acks() {
        let mcache = MCache::new(8, 0);
        let fseq = Arc::new(Fseq::new(0));
        let mut tx = Sender::new(Arc::clone(&mcache), vec![Arc::clone(&fseq)]);
        let mut rx = Receiver::new(Arc::clone(&mcache), Arc::clone(&fseq));

        assert_eq!(rx.try_recv(), None);
        tx.send(0xA, 0, 10, 0, 0);
        tx.send(0xB, 0, 20, 0, 0);

        assert_eq!(rx.recv().sig, 0xA);
        assert_eq!(rx.try_recv().map(|m| m.sig), Some(0xB));
        assert_eq!(rx.try_recv(), None);

        assert_eq!(fseq.query(), 0, "nothing acknowledged yet");
        rx.ack();
        assert_eq!(fseq.query(), 2);
        assert_eq!(rx.overrun_cnt(), 0);
    }

    #[test]
    fn receiver_resyncs_after_being_lapped() {
        let mcache = MCache::new(4, 0);
        let fseq = Arc::new(Fseq::new(0));
        let mut rx = Receiver::new(Arc::clone(&mcache), fseq);
        for seq in 0..6 {
            mcache.publish(&frag(seq, seq + 1));
        }
        assert_eq!(rx.try_recv(), None);
        assert_eq!(rx.overrun_cnt(), 1);
        assert_eq!(rx.seq(), 4);
        assert_eq!(rx.try_recv().map(|m| m.seq), Some(4));
        assert_eq!(rx.try_recv().map(|m| m.seq), Some(5));
    }

    #[test]
    fn concurrent_reader_never_returns_mismatched_fields() {
        // The writer keeps `sig == seq * 3` and `chunk == seq`; a torn read
        // would break that relationship.
        let mcache = MCache::new(2, 0);
        let writer = {
            let mcache = Arc::clone(&mcache);
            std::thread::spawn(move || {
                for seq in 0..200_000u64 {
                    mcache.publish(&FragMeta {
                        seq,
                        sig: seq * 3,
                        chunk: seq as u32,
                        ..FragMeta::default()
                    });
                }
            })
        };
        let mut seq = 0u64;
        while !writer.is_finished() {
            match mcache.query(seq) {
                FragPoll::Ready(meta) => {
                    assert_eq!(meta.sig, meta.seq * 3);
                    assert_eq!(meta.chunk, meta.seq as u32);
                    seq += 1;
                }
                FragPoll::CaughtUp => {}
                FragPoll::Overrun(found) | FragPoll::Torn(found) => seq = found,
            }
        }
        writer.join().unwrap();
    }
}
