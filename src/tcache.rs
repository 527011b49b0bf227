//! Bounded duplicate cache.
//!
//! Remembers the most recent `depth` distinct fingerprints ("tags"). A tag is
//! held in two places: a FIFO ring in insertion order, which decides eviction,
//! and an open-addressed hash map with linear probing, which answers lookups.
//! The map has at least two more slots than the ring so every probe sequence
//! terminates on an empty slot.
//!
//! Tag `0` is the empty marker. It is never reported as a duplicate and never
//! stored.
//!
//! Tags are expected to be well mixed already (they are fingerprints), so the
//! map index is just the low bits of the tag.

use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Empty slot / ignored fingerprint.
pub const TCACHE_TAG_NULL: u64 = 0;

/// Shared location where the owner advertises the ring index of the oldest
/// cached tag.
pub type TCacheSync = Arc<CachePadded<AtomicU64>>;

#[derive(Debug)]
pub struct TCache {
    depth: usize,
    oldest: usize,
    ring: Box<[u64]>,
    map: Box<[u64]>,
    map_mask: usize,
    sync: TCacheSync,
}

impl TCache {
    /// Default hash map size for a cache of `depth` tags: the next power of
    /// two at or above `depth + 2`, times four for short probe sequences.
    pub fn map_cnt_default(depth: usize) -> usize {
        (depth.saturating_add(2)).next_power_of_two() << 2
    }

    /// Creates an empty cache holding up to `depth` tags.
    ///
    /// `map_cnt == 0` picks [`TCache::map_cnt_default`]. Otherwise it must be
    /// a power of two of at least `depth + 2`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TCacheGeometry`] if `depth` is zero or `map_cnt` is
    /// invalid.
    pub fn new(depth: usize, map_cnt: usize) -> Result<Self> {
        let map_cnt = if map_cnt == 0 {
            Self::map_cnt_default(depth)
        } else {
            map_cnt
        };
        if depth == 0 || !map_cnt.is_power_of_two() || map_cnt < depth.saturating_add(2) {
            return Err(Error::TCacheGeometry { depth, map_cnt });
        }
        Ok(Self {
            depth,
            oldest: 0,
            ring: vec![TCACHE_TAG_NULL; depth].into_boxed_slice(),
            map: vec![TCACHE_TAG_NULL; map_cnt].into_boxed_slice(),
            map_mask: map_cnt - 1,
            sync: Arc::new(CachePadded::new(AtomicU64::new(0))),
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn map_cnt(&self) -> usize {
        self.map.len()
    }

    /// Ring index of the oldest cached tag (the next one to be evicted).
    #[inline]
    pub fn oldest(&self) -> usize {
        self.oldest
    }

    /// Handle to the shared oldest-index location, for observers.
    pub fn sync(&self) -> TCacheSync {
        Arc::clone(&self.sync)
    }

    /// Advertises the current oldest index through the sync location.
    #[inline]
    pub fn sync_update(&self) {
        self.sync.store(self.oldest as u64, Ordering::Release);
    }

    #[inline(always)]
    fn map_start(&self, tag: u64) -> usize {
        tag as usize & self.map_mask
    }

    /// Probes for `tag`. Returns whether it was found and the slot where it
    /// was found or where the probe hit an empty slot.
    #[inline(always)]
    fn map_query(&self, tag: u64) -> (bool, usize) {
        let mut slot = self.map_start(tag);
        loop {
            let cur = self.map[slot];
            if cur == tag {
                return (true, slot);
            }
            if cur == TCACHE_TAG_NULL {
                return (false, slot);
            }
            slot = (slot + 1) & self.map_mask;
        }
    }

    /// Removes `tag` from the map, shifting later members of its probe run
    /// back so lookups never stop early on the hole.
    fn map_remove(&mut self, tag: u64) {
        let (found, mut hole) = self.map_query(tag);
        if !found {
            return;
        }
        let mut slot = hole;
        loop {
            slot = (slot + 1) & self.map_mask;
            let cur = self.map[slot];
            if cur == TCACHE_TAG_NULL {
                break;
            }
            let probe_len = slot.wrapping_sub(self.map_start(cur)) & self.map_mask;
            let hole_dist = slot.wrapping_sub(hole) & self.map_mask;
            if probe_len >= hole_dist {
                self.map[hole] = cur;
                hole = slot;
            }
        }
        self.map[hole] = TCACHE_TAG_NULL;
    }

    /// Returns true if `tag` is currently cached.
    #[cfg(test)]
    pub fn contains(&self, tag: u64) -> bool {
        tag != TCACHE_TAG_NULL && self.map_query(tag).0
    }

    /// Test-and-insert.
    ///
    /// Returns `true` if `tag` is already cached; the cache is then left
    /// untouched (a duplicate does not refresh its age). Otherwise inserts
    /// `tag`, evicting the oldest tag if the cache is full, and returns
    /// `false`.
    #[inline]
    pub fn insert(&mut self, tag: u64) -> bool {
        if tag == TCACHE_TAG_NULL {
            return false;
        }
        let (found, mut slot) = self.map_query(tag);
        if found {
            return true;
        }

        let evict = self.ring[self.oldest];
        if evict != TCACHE_TAG_NULL {
            self.map_remove(evict);
            slot = self.map_query(tag).1;
        }
        self.map[slot] = tag;
        self.ring[self.oldest] = tag;
        self.oldest += 1;
        if self.oldest == self.depth {
            self.oldest = 0;
        }
        false
    }
}
