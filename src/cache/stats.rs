//! Buffer cache statistics

use parking_lot::Mutex;

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total `read` and `read_ahead` calls
    pub reads: u64,
    /// `read_ahead` calls
    pub async_reads: u64,
    /// Reads answered without fetching or waiting on a fetch
    pub hits: u64,
    /// Fetches this cache issued to a backing store
    pub fetches: u64,
    /// Times a read waited on another read's fetch instead of fetching
    pub coalesced: u64,
    /// Fetches that failed
    pub fetch_failures: u64,
    /// Predicated writes
    pub writes: u64,
    /// Predicated truncates
    pub truncates: u64,
    /// Predicated attribute changes
    pub attribute_changes: u64,
    /// Bytes returned by reads
    pub bytes_read: u64,
    /// Bytes returned by reads that came from already cached data
    pub bytes_cached: u64,
    /// Bytes delivered by fetches
    pub bytes_fetched: u64,
    /// Bytes supplied by predicated writes
    pub bytes_written: u64,
}

impl CacheStats {
    /// Percentage of reads served entirely from cache
    pub fn hit_rate(&self) -> f64 {
        if self.reads == 0 {
            0.0
        } else {
            (self.hits as f64 / self.reads as f64) * 100.0
        }
    }
}

/// Shared, lock-protected counters
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<CacheStats>,
}

impl StatsRecorder {
    pub(crate) fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut self.inner.lock());
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        *self.inner.lock()
    }
}
