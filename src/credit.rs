//! Credit ledger shared by all inputs of a tile.
//!
//! `cr_avail` is how many more fragments may be published before the slowest
//! consumer could be overrun. It drops by one per publish and is only raised
//! by [`CreditLedger::replenish`] during housekeeping. `cr_filt` counts
//! duplicates dropped while fragments were still in flight; they were read
//! from an input but never published, so credit returned to inputs must
//! account for them too.

use crate::seq::seq_diff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditLedger {
    cr_max: u64,
    cr_avail: u64,
    cr_filt: u64,
}

impl CreditLedger {
    /// A ledger with no credit yet. The first replenish grants it.
    pub fn new(cr_max: u64) -> Self {
        Self {
            cr_max,
            cr_avail: 0,
            cr_filt: 0,
        }
    }

    #[inline(always)]
    pub fn cr_max(&self) -> u64 {
        self.cr_max
    }

    #[inline(always)]
    pub fn cr_avail(&self) -> u64 {
        self.cr_avail
    }

    #[inline(always)]
    pub fn cr_filt(&self) -> u64 {
        self.cr_filt
    }

    /// Upper bound on input fragments not yet safely consumed downstream:
    /// those published but not acknowledged plus those filtered meanwhile.
    ///
    /// Attributed in full to whichever input credit is being returned to.
    #[inline(always)]
    pub fn exposed(&self) -> u64 {
        self.cr_max - self.cr_avail + self.cr_filt
    }

    #[inline(always)]
    pub fn is_backpressured(&self) -> bool {
        self.cr_avail <= self.cr_filt
    }

    /// Spends one credit.
    #[inline(always)]
    pub fn on_publish(&mut self) {
        debug_assert!(self.cr_avail > 0);
        self.cr_avail -= 1;
    }

    /// Records a dropped duplicate. Only counts while something is in flight.
    #[inline(always)]
    pub fn on_filter(&mut self) {
        self.cr_filt += (self.cr_avail < self.cr_max) as u64;
    }

    /// Recomputes available credit from consumer progress.
    ///
    /// `seq` is the next output sequence number; `out_seqs` the last observed
    /// counter of every consumer. Each consumer grants `cr_max` minus its lag
    /// (clamped to `[0, cr_max]`) and the ledger takes the minimum. Once all
    /// credit is back, `cr_filt` is cleared.
    ///
    /// Returns the index of the consumer that limited credit below `cr_max`,
    /// if any. Does nothing while credit is already full.
    pub fn replenish<I>(&mut self, seq: u64, out_seqs: I) -> Option<usize>
    where
        I: IntoIterator<Item = u64>,
    {
        if self.cr_avail >= self.cr_max {
            return None;
        }
        let mut slowest = None;
        let mut cr_avail = self.cr_max;
        for (idx, out_seq) in out_seqs.into_iter().enumerate() {
            let lag = seq_diff(seq, out_seq).max(0) as u64;
            let out_cr_avail = self.cr_max.saturating_sub(lag);
            if out_cr_avail < cr_avail {
                slowest = Some(idx);
                cr_avail = out_cr_avail;
            }
        }
        self.cr_avail = cr_avail;
        if self.cr_avail == self.cr_max {
            self.cr_filt = 0;
        }
        slowest
    }
}
