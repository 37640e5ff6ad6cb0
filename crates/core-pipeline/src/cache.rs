//! Intermediate-result cache.
//!
//! Content-addressed by node fingerprint: after a node produces output the
//! (fingerprint → buffer) pair is inserted, and the next run probes before
//! invoking the node at all. Capacity is bounded per pipeline; eviction
//! prefers obsolete entries, then the least-hit one.

use std::collections::HashMap;

use tracing::{debug, trace};

use core_image::{Roi, SharedBuffer};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub buffer: SharedBuffer,
    /// Roi the buffer was produced for; zoom invalidation compares this.
    pub roi: Roi,
    pub hits: u64,
    pub obsolete: bool,
}

#[derive(Debug)]
pub struct PipelineCache {
    entries: HashMap<u64, CacheEntry>,
    max_entries: usize,
    probes: u64,
    hits: u64,
}

impl PipelineCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            probes: 0,
            hits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (probes, hits) counters since construction or the last flush.
    pub fn stats(&self) -> (u64, u64) {
        (self.probes, self.hits)
    }

    /// Look up a fingerprint; on hit the entry's counter increments and the
    /// buffer handle is returned (no pixel copy).
    pub fn probe(&mut self, fingerprint: u64) -> Option<SharedBuffer> {
        self.probes += 1;
        match self.entries.get_mut(&fingerprint) {
            Some(e) if !e.obsolete => {
                e.hits += 1;
                self.hits += 1;
                trace!(target: "pipeline.cache", fingerprint, hits = e.hits, "hit");
                Some(e.buffer.clone())
            }
            _ => None,
        }
    }

    pub fn insert(&mut self, fingerprint: u64, buffer: SharedBuffer, roi: Roi) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&fingerprint) {
            self.evict_one();
        }
        self.entries.insert(
            fingerprint,
            CacheEntry {
                buffer,
                roi,
                hits: 0,
                obsolete: false,
            },
        );
    }

    fn evict_one(&mut self) {
        // Obsolete entries go first; otherwise the least-hit entry.
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (!e.obsolete, e.hits))
            .map(|(k, _)| *k);
        if let Some(k) = victim {
            self.entries.remove(&k);
            trace!(target: "pipeline.cache", fingerprint = k, "evicted");
        }
    }

    /// Drop everything.
    pub fn flush(&mut self) {
        let dropped = self.entries.len();
        self.entries.clear();
        self.probes = 0;
        self.hits = 0;
        if dropped > 0 {
            debug!(target: "pipeline.cache", dropped, "flushed");
        }
    }

    /// Drop one fingerprint (tail-node invalidation on `TOP_CHANGED`).
    pub fn invalidate(&mut self, fingerprint: u64) {
        if self.entries.remove(&fingerprint).is_some() {
            trace!(target: "pipeline.cache", fingerprint, "invalidated");
        }
    }

    /// Drop entries whose roi differs from `roi` (`ZOOMED` reaction).
    pub fn invalidate_roi_mismatch(&mut self, roi: &Roi) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.roi == *roi);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(target: "pipeline.cache", dropped, "stale rois invalidated");
        }
    }

    /// Mark every entry obsolete; probes miss until re-inserted. Used when
    /// the source raw was re-read underneath us.
    pub fn mark_all_obsolete(&mut self) {
        for e in self.entries.values_mut() {
            e.obsolete = true;
        }
    }
}
