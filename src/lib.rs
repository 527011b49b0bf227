//! # Dedup Tile
//!
//! A lock-free, credit flow-controlled deduplication stage for low-latency
//! pipelines built from single-producer ring buffers.
//!
//! A [`DedupTile`] sits between many producers and many consumers. It polls
//! every input ring, drops fragments whose 64-bit fingerprint it has seen
//! recently, and republishes the survivors in order on one output ring. It
//! never lets a producer overwrite a fragment the tile has not finished with,
//! and never overruns a reliable consumer of its own output.
//!
//! All coordination is plain shared memory with a single writer per field:
//!
//! - [`MCache`] carries fragment metadata. Readers validate every slot with a
//!   sequence stamp re-check, so a slot being rewritten is detected rather
//!   than misread.
//! - [`Fseq`] is how a consumer tells its producer how far it has consumed.
//!   The gap between a producer's sequence number and the slowest consumer's
//!   counter is the producer's remaining credit.
//! - [`Cnc`] is the supervisor's control block: run/halt signal, heartbeat and
//!   a few diagnostic words.
//!
//! ## Spin-Wait Behavior
//!
//! The tile is a single-threaded busy loop. It never parks and never takes a
//! lock, so it **consumes a full logical core** whether or not there is
//! traffic. Housekeeping (credit return, heartbeats, control signals) is
//! folded into the same loop on a randomized deadline instead of a second
//! thread.
//!
//! ## Modules
//!
//! - [`mcache`]: Fragment metadata ring plus credit-honoring
//!   [`Sender`] and reliable [`Receiver`] endpoints.
//! - [`fseq`]: Flow-control counters and their diagnostics.
//! - [`cnc`]: Control block and signals.
//! - [`tcache`]: Bounded duplicate cache.
//! - [`tile`]: The dedup tile itself.
//!
//! ## License
//!
//! Copyright © 2005–2025
//! IKH Software, Inc.
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

pub mod cnc;
pub mod config;
pub mod credit;
pub mod error;
pub mod fseq;
pub mod mcache;
pub mod schedule;
pub mod seq;
pub mod stats;
pub mod tcache;
pub mod tempo;
pub mod tile;

pub use cnc::{Cnc, CncDiag, CncSignal};
pub use config::TileConfig;
pub use credit::CreditLedger;
pub use error::{Error, Result};
pub use fseq::{Fseq, FseqDiag};
pub use mcache::{FragMeta, FragPoll, MCache, Receiver, Sender, ts_comp, ts_decomp};
pub use stats::Quantiles;
pub use tcache::TCache;
pub use tempo::{Clock, ManualClock, MonoClock, mono_time_ns};
pub use tile::{DedupTile, InLink, Step};
