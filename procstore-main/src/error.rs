//! Error types for the ingestion and query engine.
//!
//! Each concern gets its own enum so callers can tell a recoverable
//! back-pressure signal apart from a degraded cache or a dead store.

use crate::record::BatchId;
use std::time::Duration;
use thiserror::Error;

/// Durable store failures.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store could not be opened or reached
    #[error("Store connection error: {0}")]
    Connection(String),

    /// A statement failed to prepare or execute
    #[error("Store query error: {0}")]
    Query(String),

    /// A row could not be converted to or from its stored form
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// The blocking worker running the statement went away
    #[error("Store task error: {0}")]
    Task(String),
}

impl From<duckdb::Error> for StoreError {
    fn from(err: duckdb::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Cache backend failures. Every variant is treated as a miss on the query path.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The backend could not serve the request
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl From<duckdb::Error> for CacheError {
    fn from(err: duckdb::Error) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Returned by the buffer when accepting another record would exceed the
/// configured memory cap. Callers should back off or shed load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Write-behind buffer full: {buffered} records buffered (cap {cap})")]
pub struct BufferFullError {
    pub buffered: usize,
    pub cap: usize,
}

/// Ingestion failures surfaced to the caller.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error(transparent)]
    BufferFull(#[from] BufferFullError),

    /// The sample failed validation and was not buffered
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Flush failures.
#[derive(Error, Debug, Clone)]
pub enum FlushError {
    /// A single attempt failed; retried internally with backoff
    #[error("Transient flush failure for batch {batch_id} (attempt {attempt}): {reason}")]
    Transient {
        batch_id: BatchId,
        attempt: u32,
        reason: String,
    },

    /// Retries exhausted; the batch was dropped
    #[error("Batch {batch_id} dropped after {attempts} attempts ({records} records lost): {reason}")]
    Fatal {
        batch_id: BatchId,
        records: usize,
        attempts: u32,
        reason: String,
    },
}

/// Query failures surfaced to the caller. Cache failures never appear here.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// A store read exceeded its deadline; not retried
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid query descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Failures while assembling an engine from configuration.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
