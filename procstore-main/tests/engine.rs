use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use mockall::mock;
use procstore_core::aggregation::{start_of_day, AggregateKey, GroupStats, KeyField, KeyPattern, AggregateSums};
use procstore_core::clock::{Clock, ManualClock};
use procstore_core::config::EngineConfig;
use procstore_core::maintainer::{AggregationMaintainer, MaintainerConfig};
use procstore_core::metrics::ENGINE_COUNTERS;
use procstore_core::record::FlushBatch;
use procstore_core::router::QueryRouter;
use procstore_core::storage::cache::DuckDbCache;
use procstore_core::storage::duckdb::DuckDbStore;
use procstore_core::storage::Expiry;
use procstore_core::{
    BufferConfig, CacheError, CacheStore, DurableStore, Engine, FlushError, Granularity, Metric, OsKind,
    ProcessSample, QueryDescriptor, QueryError, ResultSource, StoreError, TimeRange, WriteBehindBuffer,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
}

fn yesterday() -> NaiveDate {
    today().pred_opt().unwrap()
}

fn noon() -> DateTime<Utc> {
    start_of_day(today()) + ChronoDuration::hours(12)
}

fn sample(machine: &str, day: NaiveDate, minute: i64, cpu: f64) -> ProcessSample {
    ProcessSample {
        machine_id: machine.to_string(),
        machine_name: Some(format!("{}.local", machine)),
        os_kind: OsKind::Unix,
        timestamp: start_of_day(day) + ChronoDuration::minutes(minute),
        cpu_usage: cpu,
        mem_usage: (cpu * 1000.0) as u64,
        process_name: "worker".to_string(),
        pid: Some(minute),
        user: Some("svc".to_string()),
        extra: BTreeMap::new(),
    }
}

fn avg_cpu(range: TimeRange) -> QueryDescriptor {
    QueryDescriptor::builder(range)
        .machine("m1")
        .metric(Metric::AvgCpu)
        .granularity(Granularity::Total)
        .build()
}

struct Harness {
    engine: Engine,
    store: Arc<DuckDbStore>,
    cache: Arc<DuckDbCache>,
}

async fn harness(config: EngineConfig) -> Harness {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::new(noon()));
    let store = Arc::new(DuckDbStore::new_in_memory().unwrap());
    let cache = Arc::new(DuckDbCache::new_in_memory(clock.clone(), Duration::from_secs(60)).unwrap());
    let engine = Engine::open(store.clone(), cache.clone(), clock, &config).await.unwrap();
    Harness { engine, store, cache }
}

#[tokio::test]
async fn no_records_lost_and_caller_order_kept() {
    let h = harness(EngineConfig {
        batch_size: 64,
        ..EngineConfig::default()
    })
    .await;
    let engine = Arc::new(h.engine);

    let mut callers = Vec::new();
    for caller in 0..3 {
        let engine = engine.clone();
        callers.push(tokio::spawn(async move {
            for i in 0..100 {
                let mut s = sample("m1", today(), 0, 1.0 + caller as f64);
                s.process_name = format!("caller-{}", caller);
                s.pid = Some(i);
                engine.ingest(s).await.unwrap();
            }
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }
    engine.flush_now().await.unwrap();

    assert_eq!(h.store.count_records().await.unwrap(), 300);

    let raw = QueryDescriptor::builder(TimeRange::day(today())).machine("m1").records().build();
    let records = engine.query(&raw).await.unwrap().records().to_vec();
    assert_eq!(records.len(), 300);
    for caller in 0..3 {
        let pids: Vec<i64> = records
            .iter()
            .filter(|r| r.process_name == format!("caller-{}", caller))
            .filter_map(|r| r.pid)
            .collect();
        assert_eq!(pids, (0..100).collect::<Vec<_>>());
    }
    assert_eq!(records[0].user.as_deref(), Some("svc"));
    assert_eq!(records[0].machine_name.as_deref(), Some("m1.local"));
}

#[tokio::test]
async fn maintained_average_matches_persisted_records() {
    let h = harness(EngineConfig::default()).await;
    let cpus = [3.5, 17.25, 42.0, 99.9, 0.0, 12.125];
    for (i, cpu) in cpus.iter().enumerate() {
        h.engine.ingest(sample("m1", yesterday(), i as i64, *cpu)).await.unwrap();
    }
    h.engine.flush_now().await.unwrap();

    let key = AggregateKey::new("m1", OsKind::Unix, yesterday(), Metric::AvgCpu);
    let lookup = h.engine.maintainer().get_or_rebuild(&key).await.unwrap();
    let expected = cpus.iter().sum::<f64>() / cpus.len() as f64;
    assert!((lookup.value.mean().unwrap() - expected).abs() < 1e-9);
    assert_eq!(lookup.value.count, cpus.len() as u64);

    // incremental maintenance keeps agreeing with the store
    h.engine.ingest(sample("m1", yesterday(), 30, 50.0)).await.unwrap();
    h.engine.flush_now().await.unwrap();
    let cached = h.engine.maintainer().get(&key).await.unwrap().unwrap();
    let rebuilt = h.engine.maintainer().rebuild(&key).await.unwrap();
    assert!((cached.mean().unwrap() - rebuilt.mean().unwrap()).abs() < 1e-9);
    assert_eq!(cached.count, rebuilt.count);
}

#[tokio::test]
async fn hybrid_answer_equals_answer_after_full_flush() {
    let h = harness(EngineConfig::default()).await;
    for (i, cpu) in [12.0, 18.0, 30.0].iter().enumerate() {
        h.engine.ingest(sample("m1", yesterday(), i as i64, *cpu)).await.unwrap();
    }
    h.engine.ingest(sample("m1", today(), 5, 70.0)).await.unwrap();
    h.engine.flush_now().await.unwrap();
    for (i, cpu) in [1.0, 2.0].iter().enumerate() {
        h.engine.ingest(sample("m1", today(), 60 + i as i64, *cpu)).await.unwrap();
    }

    let descriptor = QueryDescriptor::builder(TimeRange::days(yesterday(), today()))
        .machine("m1")
        .metrics([Metric::AvgCpu, Metric::ProcessCount, Metric::TotalMem])
        .granularity(Granularity::Daily)
        .build();
    let hybrid = h.engine.query(&descriptor).await.unwrap();
    assert_eq!(hybrid.source, ResultSource::Hybrid);

    h.engine.flush_now().await.unwrap();
    let mut store_only = descriptor.clone();
    store_only.machine_id = None;
    let flushed = h.engine.query(&store_only).await.unwrap();
    assert_eq!(flushed.source, ResultSource::Store);

    assert_eq!(hybrid.aggregates().len(), flushed.aggregates().len());
    for (a, b) in hybrid.aggregates().iter().zip(flushed.aggregates()) {
        assert_eq!(a.bucket, b.bucket);
        assert_eq!(a.metric, b.metric);
        assert_eq!(a.sample_count, b.sample_count);
        assert!((a.value.unwrap() - b.value.unwrap()).abs() < 1e-9);
    }
}

#[tokio::test]
async fn replayed_batch_is_not_duplicated() {
    let store = DuckDbStore::new_in_memory().unwrap();
    store.init().await.unwrap();
    let records = (0..5)
        .map(|i| procstore_core::ProcessRecord::from_sample(sample("m1", today(), i, 10.0), i as u64))
        .collect();
    let batch = FlushBatch::new(records, noon());

    assert!(store.bulk_insert(&batch).await.unwrap());
    assert!(store.bulk_insert(&batch).await.unwrap());
    assert!(store.batch_committed(batch.id).await.unwrap());
    assert_eq!(store.count_records().await.unwrap(), 5);
}

#[tokio::test]
async fn deleted_cache_entry_heals_from_store() {
    let h = harness(EngineConfig::default()).await;
    for (i, cpu) in [20.0, 40.0].iter().enumerate() {
        h.engine.ingest(sample("m1", yesterday(), i as i64, *cpu)).await.unwrap();
    }
    h.engine.flush_now().await.unwrap();

    let descriptor = avg_cpu(TimeRange::day(yesterday()));
    h.engine.query(&descriptor).await.unwrap();
    assert_eq!(h.engine.query(&descriptor).await.unwrap().source, ResultSource::Cache);

    let key = AggregateKey::new("m1", OsKind::Unix, yesterday(), Metric::AvgCpu);
    h.cache.delete(&key.cache_key(KeyField::Sum)).await.unwrap();

    let healed = h.engine.query(&descriptor).await.unwrap();
    assert!(matches!(healed.source, ResultSource::Store | ResultSource::Hybrid));
    assert_eq!(healed.value(Metric::AvgCpu), Some(30.0));

    let next = h.engine.query(&descriptor).await.unwrap();
    assert_eq!(next.source, ResultSource::Cache);
    assert_eq!(next.value(Metric::AvgCpu), Some(30.0));
}

#[tokio::test]
async fn size_trigger_flushes_exactly_one_batch() {
    let h = harness(EngineConfig {
        batch_size: 1000,
        ..EngineConfig::default()
    })
    .await;

    for i in 0..1500 {
        h.engine.ingest(sample("m1", today(), i % 600, 5.0)).await.unwrap();
    }
    if let Some(result) = h.engine.buffer().wait_for_flush().await {
        result.unwrap();
    }

    let stats = h.engine.stats().await.unwrap();
    assert_eq!(stats.persisted_records, 1000);
    assert_eq!(stats.buffer.flushed_batches, 1);
    assert_eq!(stats.buffer.pending_records, 500);

    let report = h.engine.flush_now().await.unwrap();
    assert_eq!(report.records, 500);
    assert_eq!(h.store.count_records().await.unwrap(), 1500);
}

#[tokio::test]
async fn todays_average_spans_store_and_buffer() {
    let h = harness(EngineConfig::default()).await;
    h.engine.ingest(sample("m1", today(), 1, 40.0)).await.unwrap();
    h.engine.ingest(sample("m1", today(), 2, 60.0)).await.unwrap();
    h.engine.flush_now().await.unwrap();
    for (i, cpu) in [10.0, 20.0, 30.0].iter().enumerate() {
        h.engine.ingest(sample("m1", today(), 10 + i as i64, *cpu)).await.unwrap();
    }

    let result = h.engine.query(&avg_cpu(TimeRange::day(today()))).await.unwrap();
    assert_eq!(result.source, ResultSource::Hybrid);
    assert!((result.value(Metric::AvgCpu).unwrap() - 32.0).abs() < 1e-9);
    assert_eq!(result.aggregates()[0].sample_count, 5);
}

/// DuckDB store with scripted misbehaviour: failed writes, slow writes
/// that still commit, slow reads, and a buffer flush forced in front of
/// every aggregate read.
struct ScriptedStore {
    inner: DuckDbStore,
    failures_left: AtomicU32,
    write_delay: Mutex<Option<Duration>>,
    read_delay: Mutex<Option<Duration>>,
    flush_before_read: OnceLock<WriteBehindBuffer>,
    aggregate_reads: AtomicU32,
}

impl ScriptedStore {
    fn new() -> Self {
        Self {
            inner: DuckDbStore::new_in_memory().unwrap(),
            failures_left: AtomicU32::new(0),
            write_delay: Mutex::new(None),
            read_delay: Mutex::new(None),
            flush_before_read: OnceLock::new(),
            aggregate_reads: AtomicU32::new(0),
        }
    }

    fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// The next write commits only after `delay`, even if its caller has
    /// stopped waiting by then.
    fn delay_next_write(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    fn flush_before_reads(&self, buffer: WriteBehindBuffer) {
        let _ = self.flush_before_read.set(buffer);
    }

    async fn before_aggregate_read(&self) {
        self.aggregate_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(buffer) = self.flush_before_read.get() {
            buffer.flush_now().await.unwrap();
        }
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DurableStore for ScriptedStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.inner.init().await
    }

    async fn bulk_insert(&self, batch: &FlushBatch) -> Result<bool, StoreError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("store offline".to_string()));
        }

        let delay = self.write_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            let inner = self.inner.clone();
            let batch = batch.clone();
            // detached: a timed-out caller drops the handle, not the write
            let write = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.bulk_insert(&batch).await
            });
            return write.await.map_err(|e| StoreError::Task(e.to_string()))?;
        }
        self.inner.bulk_insert(batch).await
    }

    async fn query_aggregate(
        &self,
        pattern: &KeyPattern,
        range: &TimeRange,
        before_sequence: Option<u64>,
    ) -> Result<AggregateSums, StoreError> {
        self.before_aggregate_read().await;
        self.inner.query_aggregate(pattern, range, before_sequence).await
    }

    async fn query_grouped(
        &self,
        descriptor: &QueryDescriptor,
        before_sequence: Option<u64>,
    ) -> Result<Vec<GroupStats>, StoreError> {
        self.before_aggregate_read().await;
        self.inner.query_grouped(descriptor, before_sequence).await
    }

    async fn query_raw(&self, descriptor: &QueryDescriptor) -> Result<Vec<procstore_core::ProcessRecord>, StoreError> {
        self.inner.query_raw(descriptor).await
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        self.inner.count_records().await
    }

    async fn next_sequence(&self) -> Result<u64, StoreError> {
        self.inner.next_sequence().await
    }
}

async fn scripted_engine(store: Arc<ScriptedStore>) -> Engine {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(noon()));
    let cache = Arc::new(DuckDbCache::new_in_memory(clock.clone(), Duration::from_secs(60)).unwrap());
    let config = EngineConfig {
        flush_retry_limit: 2,
        flush_retry_backoff_base_ms: 1,
        ..EngineConfig::default()
    };
    Engine::open(store, cache, clock, &config).await.unwrap()
}

#[tokio::test]
async fn transient_write_failure_is_retried() {
    let store = Arc::new(ScriptedStore::new());
    let engine = scripted_engine(store.clone()).await;
    engine.ingest(sample("m1", today(), 1, 5.0)).await.unwrap();

    store.fail_next(2);
    let report = engine.flush_now().await.unwrap();
    assert_eq!(report.retries, 2);
    assert_eq!(report.records, 1);
    assert_eq!(store.count_records().await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_retries_drop_the_batch() {
    let store = Arc::new(ScriptedStore::new());
    let engine = scripted_engine(store.clone()).await;
    let before = ENGINE_COUNTERS.snapshot();
    for i in 0..3 {
        engine.ingest(sample("m1", today(), i, 5.0)).await.unwrap();
    }

    store.fail_next(10);
    match engine.flush_now().await {
        Err(FlushError::Fatal { records, attempts, .. }) => {
            assert_eq!(records, 3);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a fatal flush error, got {:?}", other),
    }

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.buffer.dropped_records, 3);
    assert_eq!(stats.buffer.sealed_batches, 0);
    assert!(stats.counters.dropped_records >= before.dropped_records + 3);

    // the engine keeps working once the store is back
    store.fail_next(0);
    engine.ingest(sample("m1", today(), 9, 5.0)).await.unwrap();
    assert_eq!(engine.flush_now().await.unwrap().records, 1);
    assert_eq!(store.count_records().await.unwrap(), 1);
}

mock! {
    pub Cache {}

    #[async_trait]
    impl CacheStore for Cache {
        async fn get(&self, key: &str) -> Result<Option<f64>, CacheError>;
        async fn set_with_ttl(&self, key: &str, value: f64, expiry: Expiry) -> Result<bool, CacheError>;
        async fn increment_by(&self, key: &str, delta: f64, expiry: Expiry) -> Result<f64, CacheError>;
        async fn delete(&self, key: &str) -> Result<(), CacheError>;
    }
}

fn unavailable() -> CacheError {
    CacheError::Unavailable("connection refused".to_string())
}

#[tokio::test]
async fn unreachable_cache_degrades_to_store() {
    let mut cache = MockCache::new();
    cache.expect_get().returning(|_| Err(unavailable()));
    cache.expect_set_with_ttl().returning(|_, _, _| Err(unavailable()));
    cache.expect_increment_by().returning(|_, _, _| Err(unavailable()));
    cache.expect_delete().returning(|_| Err(unavailable()));

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(noon()));
    let store = Arc::new(DuckDbStore::new_in_memory().unwrap());
    let engine = Engine::open(store, Arc::new(cache), clock, &EngineConfig::default())
        .await
        .unwrap();
    let before = ENGINE_COUNTERS.snapshot();

    engine.ingest(sample("m1", yesterday(), 1, 10.0)).await.unwrap();
    engine.ingest(sample("m1", yesterday(), 2, 30.0)).await.unwrap();
    engine.flush_now().await.unwrap();
    engine.ingest(sample("m1", yesterday(), 3, 50.0)).await.unwrap();

    let result = engine.query(&avg_cpu(TimeRange::day(yesterday()))).await.unwrap();
    assert_eq!(result.source, ResultSource::Store);
    assert_eq!(result.value(Metric::AvgCpu), Some(30.0));

    let after = ENGINE_COUNTERS.snapshot();
    assert!(after.degraded_queries > before.degraded_queries);
    assert!(after.cache_failures > before.cache_failures);
}

#[tokio::test]
async fn rebuild_counts_records_flushed_mid_read_once() {
    let store = Arc::new(ScriptedStore::new());
    let engine = scripted_engine(store.clone()).await;
    store.flush_before_reads(engine.buffer().clone());

    engine.ingest(sample("m1", yesterday(), 1, 10.0)).await.unwrap();

    let key = AggregateKey::new("m1", OsKind::Unix, yesterday(), Metric::AvgCpu);
    let rebuilt = engine.maintainer().rebuild(&key).await.unwrap();
    assert_eq!(store.count_records().await.unwrap(), 1);
    assert_eq!((rebuilt.count, rebuilt.sum), (1, 10.0));

    let cached = engine.maintainer().get(&key).await.unwrap().unwrap();
    assert_eq!((cached.count, cached.sum), (1, 10.0));
}

#[tokio::test]
async fn hybrid_query_counts_records_flushed_mid_read_once() {
    let store = Arc::new(ScriptedStore::new());
    let engine = scripted_engine(store.clone()).await;
    store.flush_before_reads(engine.buffer().clone());

    for (i, cpu) in [10.0, 20.0, 30.0].iter().enumerate() {
        engine.ingest(sample("m1", today(), i as i64, *cpu)).await.unwrap();
    }

    let descriptor = QueryDescriptor::builder(TimeRange::day(today()))
        .machine("m1")
        .metrics([Metric::ProcessCount, Metric::AvgCpu])
        .build();
    let result = engine.query(&descriptor).await.unwrap();

    assert_eq!(result.source, ResultSource::Hybrid);
    assert_eq!(store.count_records().await.unwrap(), 3);
    assert_eq!(result.value(Metric::ProcessCount), Some(3.0));
    assert_eq!(result.value(Metric::AvgCpu), Some(20.0));
}

#[tokio::test]
async fn timed_out_write_that_commits_late_is_stored_once() {
    let store = Arc::new(ScriptedStore::new());
    store.init().await.unwrap();
    let buffer = WriteBehindBuffer::new(
        store.clone(),
        BufferConfig {
            flush_retry_limit: 3,
            flush_retry_backoff_base: Duration::from_millis(200),
            store_write_timeout: Duration::from_millis(50),
            ..BufferConfig::default()
        },
    );
    for i in 0..5 {
        buffer
            .add(procstore_core::ProcessRecord::from_sample(sample("m1", today(), i, 5.0), 0))
            .unwrap();
    }

    store.delay_next_write(Duration::from_millis(150));
    let report = buffer.flush_now().await.unwrap();
    assert!(report.retries >= 1);
    assert_eq!(report.records, 5);

    // let the abandoned write finish either way
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.count_records().await.unwrap(), 5);
    assert_eq!(buffer.stats().dropped_records, 0);
}

#[tokio::test]
async fn slow_store_reads_time_out_without_retry() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(noon()));
    let store = Arc::new(ScriptedStore::new());
    store.init().await.unwrap();
    let cache = Arc::new(DuckDbCache::new_in_memory(clock.clone(), Duration::from_secs(60)).unwrap());
    let buffer = WriteBehindBuffer::new(store.clone(), BufferConfig::default());
    let deadline = Duration::from_millis(50);
    let maintainer = Arc::new(AggregationMaintainer::new(
        cache,
        store.clone(),
        buffer.clone(),
        clock.clone(),
        MaintainerConfig {
            rebuild_timeout: deadline,
            ..MaintainerConfig::default()
        },
    ));
    let router = QueryRouter::new(store.clone(), buffer, maintainer, clock, deadline);
    store.delay_reads(Duration::from_millis(300));

    let hourly = QueryDescriptor::builder(TimeRange::day(yesterday()))
        .machine("m1")
        .metric(Metric::MaxCpu)
        .granularity(Granularity::Hourly)
        .build();
    match router.query(&hourly).await {
        Err(QueryError::Timeout(after)) => assert_eq!(after, deadline),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(store.aggregate_reads.load(Ordering::SeqCst), 1);

    // a cache miss on a past day times out in its rebuild
    match router.query(&avg_cpu(TimeRange::day(yesterday()))).await {
        Err(QueryError::Timeout(after)) => assert_eq!(after, deadline),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(store.aggregate_reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reopened_engine_continues_after_highest_sequence() {
    let store = Arc::new(ScriptedStore::new());
    let engine = scripted_engine(store.clone()).await;
    engine.ingest(sample("m1", today(), 1, 1.0)).await.unwrap();
    engine.ingest(sample("m1", today(), 1, 2.0)).await.unwrap();
    engine.flush_now().await.unwrap();

    // sequence 2 is dropped, leaving a gap below the highest persisted one
    engine.ingest(sample("m1", today(), 1, 3.0)).await.unwrap();
    store.fail_next(10);
    assert!(engine.flush_now().await.is_err());
    store.fail_next(0);
    engine.ingest(sample("m1", today(), 1, 4.0)).await.unwrap();
    engine.flush_now().await.unwrap();
    assert_eq!(store.count_records().await.unwrap(), 3);
    drop(engine);

    let reopened = scripted_engine(store.clone()).await;
    reopened.ingest(sample("m1", today(), 1, 5.0)).await.unwrap();
    let snapshot = reopened.buffer().snapshot();
    assert_eq!(snapshot.visible_below(), 4);
    assert_eq!(snapshot.records().map(|r| r.sequence).collect::<Vec<_>>(), vec![4]);
    reopened.flush_now().await.unwrap();

    // same timestamp throughout, so admission order decides
    let raw = QueryDescriptor::builder(TimeRange::day(today())).machine("m1").records().build();
    let records = reopened.query(&raw).await.unwrap().records().to_vec();
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    let cpus: Vec<f64> = records.iter().map(|r| r.cpu_usage).collect();
    assert_eq!(sequences, vec![0, 1, 3, 4]);
    assert_eq!(cpus, vec![1.0, 2.0, 4.0, 5.0]);
}
