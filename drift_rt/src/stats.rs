//! Runtime statistics.
//!
//! Monotonic counters describing array-runtime activity, updated with
//! relaxed ordering: diagnostics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for array-runtime activity.
#[derive(Debug)]
pub struct RtStats {
    /// Grow operations satisfied by claiming the tail in place.
    pub grows_in_place: AtomicU64,
    /// Grow operations that fell back to reallocation.
    pub grows_relocated: AtomicU64,
    /// Large blocks successfully extended without moving.
    pub blocks_extended: AtomicU64,
    /// Thread-cache lookups that hit.
    pub cache_hits: AtomicU64,
    /// Thread-cache lookups that missed.
    pub cache_misses: AtomicU64,
    /// Array blocks allocated.
    pub arrays_allocated: AtomicU64,
    /// Payload bytes copied for reallocation, duplication, concatenation.
    pub bytes_copied: AtomicU64,
}

impl RtStats {
    /// Fresh zeroed counters.
    pub const fn new() -> Self {
        Self {
            grows_in_place: AtomicU64::new(0),
            grows_relocated: AtomicU64::new(0),
            blocks_extended: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            arrays_allocated: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for RtStats {
    fn default() -> Self {
        Self::new()
    }
}
