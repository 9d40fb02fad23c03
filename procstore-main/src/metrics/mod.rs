//! Process-wide operational counters.
//!
//! Per-instance numbers live in `BufferStats` and `EngineStats`; the
//! counters here aggregate across every engine in the process so an
//! operator can alert on dropped records without holding an engine handle.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

lazy_static::lazy_static! {
    /// Counters shared by all engines in this process.
    pub static ref ENGINE_COUNTERS: EngineCounters = EngineCounters::default();
}

#[derive(Debug, Default)]
pub struct EngineCounters {
    dropped_records: AtomicU64,
    dropped_batches: AtomicU64,
    failed_flush_attempts: AtomicU64,
    cache_failures: AtomicU64,
    rejected_ingests: AtomicU64,
    degraded_queries: AtomicU64,
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub dropped_records: u64,
    pub dropped_batches: u64,
    pub failed_flush_attempts: u64,
    pub cache_failures: u64,
    pub rejected_ingests: u64,
    pub degraded_queries: u64,
}

impl EngineCounters {
    pub fn record_dropped_batch(&self, records: usize) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        self.dropped_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_failed_flush_attempt(&self) {
        self.failed_flush_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_failure(&self) {
        self.cache_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_ingest(&self) {
        self.rejected_ingests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_query(&self) {
        self.degraded_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            failed_flush_attempts: self.failed_flush_attempts.load(Ordering::Relaxed),
            cache_failures: self.cache_failures.load(Ordering::Relaxed),
            rejected_ingests: self.rejected_ingests.load(Ordering::Relaxed),
            degraded_queries: self.degraded_queries.load(Ordering::Relaxed),
        }
    }
}
