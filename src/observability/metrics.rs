//! Cache metrics
//!
//! Lock-free counters updated on the request path and by the readahead
//! cycle, read through a [`CacheMetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::orchestrator::CacheMode;
use crate::series::MergeOutcome;

/// Atomic counters for the whole cache
#[derive(Debug)]
pub struct CacheMetrics {
    /// Queries answered entirely from cache
    pub hot: AtomicU64,
    /// Queries extended with older data
    pub warm_before: AtomicU64,
    /// Queries extended with newer data
    pub warm_after: AtomicU64,
    /// Queries fetched in full on a miss
    pub cold: AtomicU64,
    /// Queries refetched in full despite a cached entry
    pub cold_overwrite: AtomicU64,
    /// Samples returned to clients
    pub samples_served: AtomicU64,
    pub metadata_hits: AtomicU64,
    pub metadata_misses: AtomicU64,
    pub backend_failures: AtomicU64,
    /// Store calls that failed and were contained
    pub store_errors: AtomicU64,
    pub merges_applied: AtomicU64,
    pub merges_aborted: AtomicU64,
    /// Queries added to the readahead candidate set
    pub readahead_admitted: AtomicU64,
    /// Readahead cycles in which this instance was leader
    pub readahead_cycles: AtomicU64,
    pub readahead_refreshed: AtomicU64,
    pub readahead_failed: AtomicU64,
    started: Instant,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hot: AtomicU64::new(0),
            warm_before: AtomicU64::new(0),
            warm_after: AtomicU64::new(0),
            cold: AtomicU64::new(0),
            cold_overwrite: AtomicU64::new(0),
            samples_served: AtomicU64::new(0),
            metadata_hits: AtomicU64::new(0),
            metadata_misses: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            merges_applied: AtomicU64::new(0),
            merges_aborted: AtomicU64::new(0),
            readahead_admitted: AtomicU64::new(0),
            readahead_cycles: AtomicU64::new(0),
            readahead_refreshed: AtomicU64::new(0),
            readahead_failed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record how a query was served and how many samples it returned
    pub fn record_query(&self, mode: CacheMode, samples: usize) {
        let counter = match mode {
            CacheMode::Hot => &self.hot,
            CacheMode::WarmBefore => &self.warm_before,
            CacheMode::WarmAfter => &self.warm_after,
            CacheMode::Cold => &self.cold,
            CacheMode::ColdOverwrite => &self.cold_overwrite,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.samples_served
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_metadata(&self, hit: bool) {
        if hit {
            self.metadata_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metadata_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Aborted => {
                self.merges_aborted.fetch_add(1, Ordering::Relaxed);
            }
            MergeOutcome::Empty => {}
            _ => {
                self.merges_applied.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_admitted(&self) {
        self.readahead_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished readahead cycle run as leader
    pub fn record_readahead_cycle(&self, refreshed: usize, failed: usize) {
        self.readahead_cycles.fetch_add(1, Ordering::Relaxed);
        self.readahead_refreshed
            .fetch_add(refreshed as u64, Ordering::Relaxed);
        self.readahead_failed
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Fraction of datapoint queries served without a full backend fetch
    pub fn hit_rate(&self) -> f64 {
        let s = self.snapshot();
        let total = s.hot + s.warm_before + s.warm_after + s.cold + s.cold_overwrite;
        if total == 0 {
            0.0
        } else {
            (s.hot + s.warm_before + s.warm_after) as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hot: self.hot.load(Ordering::Relaxed),
            warm_before: self.warm_before.load(Ordering::Relaxed),
            warm_after: self.warm_after.load(Ordering::Relaxed),
            cold: self.cold.load(Ordering::Relaxed),
            cold_overwrite: self.cold_overwrite.load(Ordering::Relaxed),
            samples_served: self.samples_served.load(Ordering::Relaxed),
            metadata_hits: self.metadata_hits.load(Ordering::Relaxed),
            metadata_misses: self.metadata_misses.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            merges_applied: self.merges_applied.load(Ordering::Relaxed),
            merges_aborted: self.merges_aborted.load(Ordering::Relaxed),
            readahead_admitted: self.readahead_admitted.load(Ordering::Relaxed),
            readahead_cycles: self.readahead_cycles.load(Ordering::Relaxed),
            readahead_refreshed: self.readahead_refreshed.load(Ordering::Relaxed),
            readahead_failed: self.readahead_failed.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetricsSnapshot {
    pub hot: u64,
    pub warm_before: u64,
    pub warm_after: u64,
    pub cold: u64,
    pub cold_overwrite: u64,
    pub samples_served: u64,
    pub metadata_hits: u64,
    pub metadata_misses: u64,
    pub backend_failures: u64,
    pub store_errors: u64,
    pub merges_applied: u64,
    pub merges_aborted: u64,
    pub readahead_admitted: u64,
    pub readahead_cycles: u64,
    pub readahead_refreshed: u64,
    pub readahead_failed: u64,
    pub uptime: Duration,
}
