//! Cleanup statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-sweeper statistics
pub struct CleanupStats {
    /// Cycles started
    pub run_count: AtomicU64,
    /// ATR documents looked up
    pub atrs_checked: AtomicU64,
    /// Expired entries found
    pub entries_found: AtomicU64,
    /// Entries finished and removed
    pub entries_cleaned: AtomicU64,
    /// Lookups or entries that failed and will be retried next cycle
    pub cleanup_failures: AtomicU64,
    /// Client record reads or writes that failed
    pub client_record_failures: AtomicU64,
}

impl CleanupStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            run_count: AtomicU64::new(0),
            atrs_checked: AtomicU64::new(0),
            entries_found: AtomicU64::new(0),
            entries_cleaned: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
            client_record_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> CleanupStatsSnapshot {
        CleanupStatsSnapshot {
            run_count: self.run_count.load(Ordering::Relaxed),
            atrs_checked: self.atrs_checked.load(Ordering::Relaxed),
            entries_found: self.entries_found.load(Ordering::Relaxed),
            entries_cleaned: self.entries_cleaned.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            client_record_failures: self.client_record_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for CleanupStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of [`CleanupStats`]
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupStatsSnapshot {
    pub run_count: u64,
    pub atrs_checked: u64,
    pub entries_found: u64,
    pub entries_cleaned: u64,
    pub cleanup_failures: u64,
    pub client_record_failures: u64,
}
