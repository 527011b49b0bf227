//! Housekeeping event schedule.
//!
//! A tile with `in_cnt` inputs and `out_cnt` outputs has `in_cnt + out_cnt +
//! 1` housekeeping events. Each deadline performs the next one in the map;
//! when the map is exhausted it is reshuffled, so every event runs exactly
//! once per cycle in an order that changes from cycle to cycle.
//!
//! Events are stored as `u16` indices: `idx < out_cnt` receives credit from
//! output `idx`, `idx == out_cnt` is the housekeeping event proper, and
//! `idx > out_cnt` sends credit to input `idx - out_cnt - 1`.

use rand::Rng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Refresh the observed progress of one consumer.
    RecvCredit(usize),
    /// Publish sync words, heartbeat and diagnostics, check the signal and
    /// replenish credit.
    Housekeeping,
    /// Return credit to one producer and drain its diagnostics.
    SendCredit(usize),
}

#[derive(Debug, Clone)]
pub struct EventSchedule {
    map: Box<[u16]>,
    seq: usize,
    out_cnt: usize,
}

impl EventSchedule {
    /// Builds the initial schedule `[housekeeping, in 0..in_cnt, out
    /// 0..out_cnt]`.
    ///
    /// The counts must leave every index representable in a `u16`; tiles
    /// bound them at boot.
    pub fn new(in_cnt: usize, out_cnt: usize) -> Self {
        debug_assert!(in_cnt + out_cnt < u16::MAX as usize);
        let mut map = Vec::with_capacity(in_cnt + out_cnt + 1);
        map.push(out_cnt as u16);
        map.extend((0..in_cnt).map(|i| (out_cnt + 1 + i) as u16));
        map.extend((0..out_cnt).map(|o| o as u16));
        Self {
            map: map.into_boxed_slice(),
            seq: 0,
            out_cnt,
        }
    }

    /// Events per cycle.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    fn decode(&self, idx: usize) -> Event {
        if idx < self.out_cnt {
            Event::RecvCredit(idx)
        } else if idx == self.out_cnt {
            Event::Housekeeping
        } else {
            Event::SendCredit(idx - self.out_cnt - 1)
        }
    }

    /// Event due at the next deadline.
    #[inline]
    pub fn current(&self) -> Event {
        self.decode(self.map[self.seq] as usize)
    }

    /// Moves to the next event. At the end of a cycle the map is reshuffled
    /// and `true` is returned, so the caller can reshuffle anything else it
    /// rotates once per cycle.
    #[inline]
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        self.seq += 1;
        if self.seq < self.map.len() {
            return false;
        }
        self.seq = 0;
        self.map.shuffle(rng);
        true
    }
}
