//! The dedup tile.
//!
//! A [`DedupTile`] polls a set of input rings round-robin, drops fragments
//! whose fingerprint is already in its [`TCache`], and republishes the rest,
//! in order, on a single output ring read by reliable consumers.
//!
//! # Flow control
//!
//! The tile holds one credit per fragment it may still publish before the
//! slowest consumer could be overrun ([`CreditLedger`]). Credit is spent on
//! publish and only returned during housekeeping, from the consumers'
//! [`Fseq`]s. In the other direction the tile acts as a reliable consumer of
//! every input: it tells each producer how far it may overwrite through that
//! input's [`Fseq`]. Because the tile does not track which input the
//! fragments in flight came from, it assumes the worst and holds back, for
//! every input, all of them plus the duplicates dropped meanwhile.
//!
//! # Housekeeping
//!
//! Everything off the hot path is multiplexed into the run loop itself, one
//! [`Event`] per randomized deadline: refreshing a consumer's progress,
//! returning credit (and diagnostics) to a producer, or the housekeeping
//! event proper, which publishes sync words, heartbeats, checks the control
//! signal and replenishes credit.
//!
//! # Lifecycle
//!
//! [`DedupTile::boot`] validates the bindings and moves the control block
//! from `BOOT` to `RUN`. [`DedupTile::run`] spins until a supervisor signals
//! `HALT`, then gives all credit back to the inputs and resets the control
//! block to `BOOT`.

use crate::cnc::{CNC_APP_MIN_WORDS, CNC_DIAG_BACKP_CNT, CNC_DIAG_IN_BACKP, Cnc, CncSignal};
use crate::config::TileConfig;
use crate::credit::CreditLedger;
use crate::error::{Error, Result};
use crate::fseq::{FSEQ_DIAG_OVRNP_CNT, FSEQ_DIAG_OVRNR_CNT, FSEQ_DIAG_PUB_CNT, FSEQ_DIAG_SLOW_CNT, Fseq};
use crate::mcache::{FragMeta, FragPoll, MCache, ts_comp};
use crate::schedule::{Event, EventSchedule};
use crate::seq::{seq_dec, seq_gt, seq_inc};
use crate::tcache::TCache;
use crate::tempo::{Clock, MonoClock, async_min, async_reload, lazy_default};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{info, warn};

/// Maximum number of inputs per tile.
pub const IN_MAX: usize = 8192;
/// Maximum number of reliable consumers per tile.
pub const OUT_MAX: usize = 8192;

/// An input: the producer's ring and the counter through which the tile
/// grants that producer credit.
#[derive(Debug, Clone)]
pub struct InLink {
    pub mcache: Arc<MCache>,
    pub fseq: Arc<Fseq>,
}

impl InLink {
    pub fn new(mcache: Arc<MCache>, fseq: Arc<Fseq>) -> Self {
        Self { mcache, fseq }
    }
}

#[derive(Debug)]
struct InBinding {
    mcache: Arc<MCache>,
    seq: u64,
    line: usize,
    fseq: Arc<Fseq>,
    accum: [u64; 6],
}

impl InBinding {
    fn new(link: InLink) -> Self {
        let seq = link.mcache.seq_query();
        let line = link.mcache.line_idx(seq);
        Self {
            mcache: link.mcache,
            seq,
            line,
            fseq: link.fseq,
            accum: [0; 6],
        }
    }

    #[inline(always)]
    fn resync(&mut self, seq: u64) {
        self.seq = seq;
        self.line = self.mcache.line_idx(seq);
    }

    /// Returns credit to the producer, assuming `exposed` fragments read from
    /// it are not yet safely consumed downstream, and drains diagnostics.
    fn update(&mut self, exposed: u64) {
        let seq = seq_dec(self.seq, exposed);
        if seq_gt(seq, self.fseq.query()) {
            self.fseq.update(seq);
        }
        self.fseq.diag_drain(&self.accum);
        self.accum = [0; 6];
    }
}

#[derive(Debug)]
struct OutBinding {
    fseq: Arc<Fseq>,
    seq: u64,
}

/// Result of one run loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A unique fragment was republished.
    Published,
    /// A duplicate was dropped.
    Filtered,
    /// The polled input had nothing new.
    CaughtUp,
    /// The polled input's producer lapped the tile; the input was
    /// resynchronized.
    Overrun,
    /// No credit; inputs were not polled.
    Backpressured,
    /// There are no inputs.
    Idle,
    /// The control block signals `HALT`. Call [`DedupTile::halt`].
    Halt,
}

/// A booted dedup tile. See the [module documentation](self).
#[derive(Debug)]
pub struct DedupTile<C: Clock = MonoClock> {
    cnc: Arc<Cnc>,
    ins: Vec<InBinding>,
    in_seq: usize,
    tcache: TCache,
    mcache: Arc<MCache>,
    seq: u64,
    outs: Vec<OutBinding>,
    ledger: CreditLedger,
    schedule: EventSchedule,
    rng: StdRng,
    async_min: u64,
    clock: C,
    now: i64,
    then: i64,
    in_backp: bool,
    backp_cnt: u64,
}

impl<C: Clock> DedupTile<C> {
    /// Validates the bindings and starts the tile.
    ///
    /// - `cnc` must be in `BOOT` and have at least [`CNC_APP_MIN_WORDS`] app
    ///   words. It is left in `RUN` on success.
    /// - Every input is read from the sequence number advertised by its ring.
    /// - `mcache` is the output ring; publishing resumes at its advertised
    ///   sequence number.
    /// - `outs` are the counters of the output's reliable consumers.
    ///
    /// # Errors
    ///
    /// Any [`Error`] describing the first invalid binding or parameter. The
    /// control block is left untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn boot(
        cnc: Arc<Cnc>,
        ins: Vec<InLink>,
        tcache: TCache,
        mcache: Arc<MCache>,
        outs: Vec<Arc<Fseq>>,
        cfg: &TileConfig,
        clock: C,
    ) -> Result<Self> {
        info!(in_cnt = ins.len(), out_cnt = outs.len(), "booting dedup");
        match Self::try_boot(cnc, ins, tcache, mcache, outs, cfg, clock) {
            Ok(tile) => {
                tile.cnc.signal(CncSignal::Run);
                info!("dedup running");
                Ok(tile)
            }
            Err(err) => {
                warn!(%err, "dedup boot failed");
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_boot(
        cnc: Arc<Cnc>,
        ins: Vec<InLink>,
        tcache: TCache,
        mcache: Arc<MCache>,
        outs: Vec<Arc<Fseq>>,
        cfg: &TileConfig,
        clock: C,
    ) -> Result<Self> {
        let in_cnt = ins.len();
        if in_cnt > IN_MAX {
            return Err(Error::TooManyIns { in_cnt, max: IN_MAX });
        }
        let out_cnt = outs.len();
        if out_cnt > OUT_MAX {
            return Err(Error::TooManyOuts { out_cnt, max: OUT_MAX });
        }
        if cnc.app_words() < CNC_APP_MIN_WORDS {
            return Err(Error::CncAppTooSmall {
                words: cnc.app_words(),
                min: CNC_APP_MIN_WORDS,
            });
        }
        let signal = cnc.signal_query();
        if signal != CncSignal::Boot {
            return Err(Error::AlreadyBooted(signal));
        }

        let min_in_depth = ins.iter().map(|l| l.mcache.depth()).min().unwrap_or(usize::MAX);
        let ins: Vec<InBinding> = ins.into_iter().map(InBinding::new).collect();

        let seq = mcache.seq_query();

        // Anything filtered or exposed downstream came from an input whose
        // ring is at least this deep, and the output must not lap its
        // consumers.
        let cr_max_max = min_in_depth.min(mcache.depth()) as u64;
        let cr_max = if cfg.cr_max == 0 { cr_max_max } else { cfg.cr_max };
        info!(cr_max, "using cr_max");
        if !(1..=cr_max_max).contains(&cr_max) {
            return Err(Error::CrMaxOutOfRange { cr_max, cr_max_max });
        }

        let outs: Vec<OutBinding> = outs
            .into_iter()
            .map(|fseq| {
                let seq = fseq.query();
                OutBinding { fseq, seq }
            })
            .collect();

        let lazy = if cfg.lazy <= 0 { lazy_default(cr_max) } else { cfg.lazy };
        info!(lazy, "configuring housekeeping (ns)");
        let schedule = EventSchedule::new(in_cnt, out_cnt);
        let async_min = async_min(lazy, schedule.len(), cfg.tick_per_ns)?;

        // Waiting for initial credits.
        cnc.app_store(CNC_DIAG_IN_BACKP, 1);
        cnc.app_store(CNC_DIAG_BACKP_CNT, 0);

        let now = clock.now();
        Ok(Self {
            cnc,
            ins,
            in_seq: 0,
            tcache,
            mcache,
            seq,
            outs,
            ledger: CreditLedger::new(cr_max),
            schedule,
            rng: StdRng::seed_from_u64(cfg.seed),
            async_min,
            clock,
            now,
            then: now,
            in_backp: true,
            backp_cnt: 0,
        })
    }

    /// Next output sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Current credit state.
    #[inline]
    pub fn credit(&self) -> CreditLedger {
        self.ledger
    }

    /// Minimum ticks between housekeeping events.
    pub fn async_min(&self) -> u64 {
        self.async_min
    }

    /// Runs until the control block signals `HALT`, then halts.
    pub fn run(mut self) {
        while self.step() != Step::Halt {}
        self.halt();
    }

    /// One run loop iteration: a housekeeping event if its deadline has
    /// passed, then a poll of the next input if credit allows.
    ///
    /// Once this returns [`Step::Halt`] it keeps doing so until the signal
    /// changes; the caller should then call [`DedupTile::halt`].
    #[inline]
    pub fn step(&mut self) -> Step {
        if self.now.wrapping_sub(self.then) >= 0 && self.housekeep() {
            return Step::Halt;
        }

        if self.ledger.is_backpressured() {
            self.backp_cnt += (!self.in_backp) as u64;
            self.in_backp = true;
            core::hint::spin_loop();
            self.now = self.clock.now();
            return Step::Backpressured;
        }
        self.in_backp = false;

        if self.ins.is_empty() {
            self.now = self.clock.now();
            return Step::Idle;
        }
        let in_idx = self.in_seq;
        self.in_seq += 1;
        if self.in_seq >= self.ins.len() {
            self.in_seq = 0;
        }

        let this_in = &self.ins[in_idx];
        let poll = this_in.mcache.poll(this_in.line, this_in.seq);
        self.consume(in_idx, poll)
    }

    /// Acts on the outcome of polling input `in_idx`: resync and count on
    /// overrun, otherwise dedup and republish.
    #[inline(always)]
    fn consume(&mut self, in_idx: usize, poll: FragPoll) -> Step {
        let this_in = &mut self.ins[in_idx];
        let meta = match poll {
            FragPoll::Ready(meta) => meta,
            FragPoll::CaughtUp => {
                self.now = self.clock.now();
                return Step::CaughtUp;
            }
            FragPoll::Overrun(seq_found) => {
                this_in.resync(seq_found);
                this_in.accum[FSEQ_DIAG_OVRNP_CNT] += 1;
                self.now = self.clock.now();
                return Step::Overrun;
            }
            FragPoll::Torn(seq_test) => {
                this_in.resync(seq_test);
                this_in.accum[FSEQ_DIAG_OVRNR_CNT] += 1;
                self.now = self.clock.now();
                return Step::Overrun;
            }
        };

        let is_dup = self.tcache.insert(meta.sig);
        self.now = self.clock.now();
        if is_dup {
            self.ledger.on_filter();
        } else {
            self.mcache.publish(&FragMeta {
                seq: self.seq,
                tspub: ts_comp(self.now),
                ..meta
            });
            self.ledger.on_publish();
            self.seq = seq_inc(self.seq, 1);
        }

        let next = seq_inc(this_in.seq, 1);
        this_in.resync(next);
        let diag_idx = FSEQ_DIAG_PUB_CNT + 2 * is_dup as usize;
        this_in.accum[diag_idx] += 1;
        this_in.accum[diag_idx + 1] += meta.sz as u64;

        if is_dup { Step::Filtered } else { Step::Published }
    }

    /// Performs the scheduled event and reloads the deadline. Returns true if
    /// the tile must halt.
    fn housekeep(&mut self) -> bool {
        match self.schedule.current() {
            Event::RecvCredit(out_idx) => {
                let out = &mut self.outs[out_idx];
                out.seq = out.fseq.query();
            }
            Event::SendCredit(in_idx) => {
                let exposed = self.ledger.exposed();
                self.ins[in_idx].update(exposed);
            }
            Event::Housekeeping => {
                self.mcache.seq_update(self.seq);
                self.tcache.sync_update();

                self.cnc.heartbeat(self.now);
                self.cnc.app_store(CNC_DIAG_IN_BACKP, self.in_backp as u64);
                self.cnc.app_add(CNC_DIAG_BACKP_CNT, self.backp_cnt);
                self.backp_cnt = 0;

                match self.cnc.signal_query() {
                    CncSignal::Run => {}
                    CncSignal::Halt => return true,
                    CncSignal::Ack => self.cnc.signal(CncSignal::Run),
                    other => {
                        warn!(signal = %other, raw = other.raw(), "unexpected signal, resuming");
                        self.cnc.signal(CncSignal::Run);
                    }
                }

                let out_seqs = self.outs.iter().map(|out| out.seq);
                if let Some(slowest) = self.ledger.replenish(self.seq, out_seqs) {
                    self.outs[slowest].fseq.diag_add(FSEQ_DIAG_SLOW_CNT, 1);
                }
            }
        }

        if self.schedule.advance(&mut self.rng) && self.ins.len() > 1 {
            self.ins.shuffle(&mut self.rng);
            self.in_seq = 0;
        }
        self.then = self.now.wrapping_add(async_reload(&mut self.rng, self.async_min));
        false
    }

    /// Returns all credit to the inputs and resets the control block to
    /// `BOOT`.
    ///
    /// Every consumer must be stopped or caught up: inputs are told nothing
    /// read from them is still exposed.
    pub fn halt(mut self) {
        info!("halting dedup");
        for this_in in self.ins.iter_mut().rev() {
            this_in.update(0);
        }
        info!("dedup halted");
        self.cnc.signal(CncSignal::Boot);
    }
}
