//! Ingestion and query facade.
//!
//! [`Engine`] wires the durable store, the aggregate cache, the write-behind
//! buffer, the aggregation maintainer and the query router together. It is
//! the only type callers need: `ingest` acknowledges a record once it is
//! buffered and counted, `query` answers from whichever side is cheapest.

use crate::buffer::{BufferStats, FlushObserver, FlushResult, WriteBehindBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, Settings};
use crate::error::{EngineError, IngestError, QueryError, StoreError};
use crate::maintainer::AggregationMaintainer;
use crate::metrics::{CounterSnapshot, ENGINE_COUNTERS};
use crate::query::{QueryDescriptor, ResultSet};
use crate::record::{ProcessRecord, ProcessSample, RecordId};
use crate::router::{QueryPlan, QueryRouter};
use crate::storage::cache::DuckDbCache;
use crate::storage::duckdb::DuckDbStore;
use crate::storage::{CacheStore, DurableStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Acknowledgement returned once a record is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub accepted: bool,
    /// Unflushed records ahead of this one at admission
    pub queued_position: usize,
    pub record_id: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub buffer: BufferStats,
    pub persisted_records: u64,
    /// Ingestions between buffering and cache increment right now
    pub contributions_in_flight: u64,
    /// Process-wide counters, shared with every other engine
    pub counters: CounterSnapshot,
}

pub struct Engine {
    store: Arc<dyn DurableStore>,
    buffer: WriteBehindBuffer,
    maintainer: Arc<AggregationMaintainer>,
    router: QueryRouter,
}

impl Engine {
    /// Assembles an engine over already initialized adapters. Admission
    /// sequences start at `first_sequence`, which must be above every
    /// sequence already persisted.
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
        first_sequence: u64,
    ) -> Self {
        let buffer = WriteBehindBuffer::starting_at(store.clone(), config.buffer_config(), first_sequence);
        let maintainer = Arc::new(AggregationMaintainer::new(
            cache,
            store.clone(),
            buffer.clone(),
            clock.clone(),
            config.maintainer_config(),
        ));

        let observer: Arc<dyn FlushObserver> = maintainer.clone();
        buffer.register_observer(Arc::downgrade(&observer));

        let router = QueryRouter::new(
            store.clone(),
            buffer.clone(),
            maintainer.clone(),
            clock,
            config.query_timeout(),
        );

        Self {
            store,
            buffer,
            maintainer,
            router,
        }
    }

    /// Initializes the store and assembles an engine. Admission sequences
    /// continue after the highest one already persisted.
    pub async fn open(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        store.init().await?;
        let next_sequence = store.next_sequence().await?;
        info!(next_sequence, batch_size = config.batch_size, "engine opened");
        Ok(Self::new(store, cache, clock, config, next_sequence))
    }

    /// Builds the DuckDB-backed engine described by `settings`, on the
    /// system clock.
    pub async fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        Self::from_settings_with_clock(settings, Arc::new(SystemClock)).await
    }

    pub async fn from_settings_with_clock(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        if settings.store.engine != "duckdb" {
            return Err(EngineError::Configuration(format!(
                "Unsupported store engine: {}",
                settings.store.engine
            )));
        }
        if settings.cache.engine != "duckdb" || settings.cache.connection != ":memory:" {
            return Err(EngineError::Configuration(format!(
                "Unsupported cache backend: {} at {}",
                settings.cache.engine, settings.cache.connection
            )));
        }

        let store = Arc::new(DuckDbStore::new(&settings.store.connection, &settings.store.options)?);
        let cache = Arc::new(DuckDbCache::new_in_memory(clock.clone(), settings.cache.sweep_interval())?);
        Self::open(store, cache, clock, &settings.engine).await
    }

    /// Starts the interval flusher.
    pub fn start(&self) {
        self.buffer.start();
    }

    /// Validates, buffers and counts one sample.
    ///
    /// The record is acknowledged before it is durable. The only rejections
    /// are invalid samples and a full buffer.
    pub async fn ingest(&self, sample: ProcessSample) -> Result<IngestAck, IngestError> {
        if let Err(reason) = sample.validate() {
            ENGINE_COUNTERS.record_rejected_ingest();
            warn!(machine_id = %sample.machine_id, %reason, "rejected invalid sample");
            return Err(IngestError::InvalidRecord(reason));
        }

        // the buffer assigns the real sequence on admission
        let record = ProcessRecord::from_sample(sample, 0);
        let record_id = record.record_id;

        let _guard = self.maintainer.begin_contribution();
        let admission = match self.buffer.add(record) {
            Ok(admission) => admission,
            Err(e) => {
                ENGINE_COUNTERS.record_rejected_ingest();
                warn!(buffered = e.buffered, cap = e.cap, "buffer full, rejecting sample");
                return Err(e.into());
            }
        };
        self.maintainer.on_record_buffered(&admission.record).await;

        Ok(IngestAck {
            accepted: true,
            queued_position: admission.position,
            record_id,
        })
    }

    pub async fn query(&self, descriptor: &QueryDescriptor) -> Result<ResultSet, QueryError> {
        let result = self.router.query(descriptor).await?;
        debug!(source = %result.source, rows = result.rows.len(), "query answered");
        Ok(result)
    }

    /// The plan `query` would execute, without executing it.
    pub fn plan(&self, descriptor: &QueryDescriptor) -> Result<QueryPlan, QueryError> {
        self.router.route(descriptor)
    }

    pub async fn flush_now(&self) -> FlushResult {
        self.buffer.flush_now().await
    }

    /// Stops the flusher and writes everything still buffered.
    pub async fn shutdown(&self) -> FlushResult {
        let result = self.buffer.shutdown().await;
        match &result {
            Ok(report) => info!(batches = report.batches, records = report.records, "engine shut down"),
            Err(e) => warn!(error = %e, "final flush failed"),
        }
        result
    }

    pub fn buffer(&self) -> &WriteBehindBuffer {
        &self.buffer
    }

    pub fn maintainer(&self) -> &Arc<AggregationMaintainer> {
        &self.maintainer
    }

    pub async fn stats(&self) -> Result<EngineStats, StoreError> {
        Ok(EngineStats {
            buffer: self.buffer.stats(),
            persisted_records: self.store.count_records().await?,
            contributions_in_flight: self.maintainer.tracker().in_flight(),
            counters: ENGINE_COUNTERS.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{start_of_day, Metric, TimeRange};
    use crate::clock::ManualClock;
    use crate::error::BufferFullError;
    use crate::record::OsKind;
    use crate::router::Route;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
    }

    fn sample(cpu: f64) -> ProcessSample {
        ProcessSample {
            machine_id: "m1".to_string(),
            machine_name: Some("db-1".to_string()),
            os_kind: OsKind::Unix,
            timestamp: start_of_day(day()) + chrono::Duration::hours(2),
            cpu_usage: cpu,
            mem_usage: 1024,
            process_name: "postgres".to_string(),
            pid: Some(7),
            user: None,
            extra: BTreeMap::new(),
        }
    }

    async fn engine(config: EngineConfig) -> Engine {
        let clock = Arc::new(ManualClock::new(start_of_day(day()) + chrono::Duration::hours(12)));
        let store = Arc::new(DuckDbStore::new_in_memory().unwrap());
        let cache = Arc::new(DuckDbCache::new_in_memory(clock.clone(), Duration::from_secs(60)).unwrap());
        Engine::open(store, cache, clock, &config).await.unwrap()
    }

    #[tokio::test]
    async fn acks_report_queue_position() {
        let engine = engine(EngineConfig::default()).await;
        let first = engine.ingest(sample(10.0)).await.unwrap();
        let second = engine.ingest(sample(20.0)).await.unwrap();

        assert!(first.accepted);
        assert_eq!(first.queued_position, 0);
        assert_eq!(second.queued_position, 1);
        assert_ne!(first.record_id, second.record_id);
        assert_eq!(engine.buffer().stats().pending_records, 2);
    }

    #[tokio::test]
    async fn invalid_samples_never_reach_the_buffer() {
        let engine = engine(EngineConfig::default()).await;
        let err = engine.ingest(sample(140.0)).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidRecord(_)));
        assert!(engine.buffer().snapshot().is_empty());
    }

    #[tokio::test]
    async fn full_buffer_rejects_with_back_pressure() {
        let engine = engine(EngineConfig {
            max_buffer_records: 2,
            ..EngineConfig::default()
        })
        .await;
        engine.ingest(sample(1.0)).await.unwrap();
        engine.ingest(sample(2.0)).await.unwrap();

        match engine.ingest(sample(3.0)).await {
            Err(IngestError::BufferFull(e)) => assert_eq!(e, BufferFullError { buffered: 2, cap: 2 }),
            other => panic!("expected BufferFull, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_persists_everything() {
        let engine = engine(EngineConfig::default()).await;
        for cpu in [5.0, 15.0, 25.0] {
            engine.ingest(sample(cpu)).await.unwrap();
        }

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.records, 3);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.persisted_records, 3);
        assert_eq!(stats.buffer.pending_records, 0);
        assert_eq!(stats.contributions_in_flight, 0);
    }

    #[tokio::test]
    async fn todays_aggregates_are_planned_as_hybrid() {
        let engine = engine(EngineConfig::default()).await;
        let descriptor = QueryDescriptor::builder(TimeRange::day(day()))
            .machine("m1")
            .metric(Metric::AvgCpu)
            .build();
        let plan = engine.plan(&descriptor).unwrap();
        assert!(matches!(plan.route, Route::Hybrid { .. }));

        engine.ingest(sample(40.0)).await.unwrap();
        let result = engine.query(&descriptor).await.unwrap();
        assert_eq!(result.value(Metric::AvgCpu), Some(40.0));
        assert!(result.as_of <= Utc::now());
    }
}
