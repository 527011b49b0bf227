use crate::cnc::CncSignal;
use thiserror::Error;

/// Configuration errors detected while booting a tile or building one of
/// its bindings.
///
/// These are never retried: a tile that fails to boot stays down and the
/// surrounding process is expected to treat the failure as fatal for that
/// tile. Runtime anomalies such as producer overruns are not errors; they
/// are counted in diagnostics and the run loop keeps going.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("in_cnt {in_cnt} too large (at most {max})")]
    TooManyIns { in_cnt: usize, max: usize },

    #[error("out_cnt {out_cnt} too large (at most {max})")]
    TooManyOuts { out_cnt: usize, max: usize },

    #[error("cnc app region has {words} words, needs at least {min}")]
    CncAppTooSmall { words: usize, min: usize },

    #[error("cnc already booted (signal {0})")]
    AlreadyBooted(CncSignal),

    #[error("cr_max {cr_max} must be in [1,{cr_max_max}] for these mcaches")]
    CrMaxOutOfRange { cr_max: u64, cr_max_max: u64 },

    #[error("bad lazy {lazy} ns for {event_cnt} housekeeping events at {tick_per_ns} ticks/ns")]
    BadLazy {
        lazy: i64,
        event_cnt: usize,
        tick_per_ns: f64,
    },

    #[error("tcache depth {depth} with map_cnt {map_cnt} is invalid (map_cnt must be a power of two >= depth+2)")]
    TCacheGeometry { depth: usize, map_cnt: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
