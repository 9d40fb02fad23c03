//! Storage adapters for durable persistence and the aggregate cache.
//!
//! This module provides the two leaf contracts the engine is built on:
//! - `DurableStore`: transactional row store for process records
//! - `CacheStore`: key/value store with atomic increment and expiry
//!
//! And their implementations over embedded DuckDB:
//! - `duckdb`: the durable store
//! - `cache`: an in-memory DuckDB table acting as the cache, with
//!   rate-limited sweeping of expired entries

pub mod cache;
pub mod duckdb;

use crate::aggregation::{AggregateSums, GroupStats, KeyPattern, TimeRange};
use crate::error::{CacheError, StoreError};
use crate::query::QueryDescriptor;
use crate::record::{FlushBatch, ProcessRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable store contract.
///
/// Implementations must make `bulk_insert` a single transaction that also
/// records the batch id, so replaying an already committed batch writes
/// nothing and still reports success.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Create tables and indexes if needed.
    async fn init(&self) -> Result<(), StoreError>;

    /// Persist a whole batch atomically. `Ok(true)` means every record of the
    /// batch is durable, whether by this call or an earlier one.
    async fn bulk_insert(&self, batch: &FlushBatch) -> Result<bool, StoreError>;

    /// Sums over persisted records matching `pattern` in `range`. With
    /// `before_sequence`, only rows whose sequence is below it count.
    async fn query_aggregate(
        &self,
        pattern: &KeyPattern,
        range: &TimeRange,
        before_sequence: Option<u64>,
    ) -> Result<AggregateSums, StoreError>;

    /// Grouped statistics for an aggregate descriptor, bucketed by its
    /// granularity and grouped by its dimensions, one entry per group after
    /// the descriptor's offset and limit. `before_sequence` as for
    /// `query_aggregate`.
    async fn query_grouped(
        &self,
        descriptor: &QueryDescriptor,
        before_sequence: Option<u64>,
    ) -> Result<Vec<GroupStats>, StoreError>;

    /// Raw records matching a descriptor in the descriptor's order.
    async fn query_raw(&self, descriptor: &QueryDescriptor) -> Result<Vec<ProcessRecord>, StoreError>;

    /// Number of persisted records.
    async fn count_records(&self) -> Result<u64, StoreError>;

    /// One past the highest persisted sequence, 0 for an empty store.
    async fn next_sequence(&self) -> Result<u64, StoreError>;
}

/// Expiry policy for cache writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Expire at an absolute instant.
    At(DateTime<Utc>),
    /// Never expire.
    Never,
    /// Only overwrite a live key and keep its current expiry; missing keys
    /// are left missing.
    Keep,
}

/// Cache contract. Every call is atomic on its own; there is no
/// multi-key transaction.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<f64>, CacheError>;

    /// Returns whether the value was written (always true unless `Expiry::Keep`
    /// hit a missing key).
    async fn set_with_ttl(&self, key: &str, value: f64, expiry: Expiry) -> Result<bool, CacheError>;

    /// Atomically adds `delta` and returns the new value. A missing key is
    /// created with `expiry`; an existing key keeps its expiry.
    async fn increment_by(&self, key: &str, delta: f64, expiry: Expiry) -> Result<f64, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}
