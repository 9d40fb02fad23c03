//! Write-behind buffer.
//!
//! Records are acknowledged once they sit in memory and reach the durable
//! store later, in batches. A flush starts when the pending sequence reaches
//! `batch_size` or when `flush_interval` has passed since the last flush,
//! whichever comes first.
//!
//! The buffer keeps two queues behind one short-held mutex:
//!
//! - `pending`: records not yet assigned to a batch
//! - `sealed`: batches waiting for (or undergoing) a durable write, oldest
//!   first. The front batch stays in place while it is retried, so it is
//!   always ahead of every pending record and keeps its batch id.
//!
//! Sequence numbers are assigned under the same lock in admission order,
//! so every buffered record carries a sequence at or above the lowest one
//! still buffered and every record below it has left the buffer. Readers use
//! that watermark to split a query between the snapshot and the store.
//!
//! Only one flush runs at a time. The flush loop drains `sealed` in order
//! and releases the flush slot under the lock once the queue is empty, so a
//! batch sealed concurrently is either picked up by the running loop or
//! starts a new one. No I/O happens while the lock is held.

use crate::error::{BufferFullError, FlushError};
use crate::aggregation::{AggregateSums, KeyPattern, TimeRange};
use crate::metrics::ENGINE_COUNTERS;
use crate::record::{FlushBatch, ProcessRecord};
use crate::storage::DurableStore;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of a completed flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Batches committed by this cycle
    pub batches: usize,
    /// Records committed by this cycle
    pub records: usize,
    /// Failed attempts that were retried successfully
    pub retries: u32,
}

pub type FlushResult = Result<FlushReport, FlushError>;

type SharedFlush = Shared<BoxFuture<'static, FlushResult>>;

/// Receives a callback after every batch that reached the durable store.
#[async_trait]
pub trait FlushObserver: Send + Sync {
    async fn on_flush_committed(&self, batch: &FlushBatch);
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Cap on pending plus sealed records
    pub max_buffer_records: usize,
    /// Retries after the first failed attempt
    pub flush_retry_limit: u32,
    pub flush_retry_backoff_base: Duration,
    pub store_write_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(60),
            max_buffer_records: 100_000,
            flush_retry_limit: 5,
            flush_retry_backoff_base: Duration::from_millis(200),
            store_write_timeout: Duration::from_secs(30),
        }
    }
}

/// Acknowledgement for one buffered record.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Number of unflushed records ahead of this one
    pub position: usize,
    /// The record as buffered, carrying its admission sequence
    pub record: ProcessRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub pending_records: usize,
    pub sealed_batches: usize,
    pub sealed_records: usize,
    pub flushed_batches: u64,
    pub flushed_records: u64,
    pub dropped_batches: u64,
    pub dropped_records: u64,
    pub failed_attempts: u64,
}

/// Immutable copy of everything not yet known to be durable.
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    batches: Vec<Arc<FlushBatch>>,
    pending: Vec<ProcessRecord>,
    watermark: u64,
}

impl BufferSnapshot {
    /// Lowest sequence held by the snapshot, or the next sequence to be
    /// assigned when it is empty. Store reads paired with this snapshot
    /// only see rows below it: everything at or above is either in the
    /// snapshot or was admitted after it.
    pub fn visible_below(&self) -> u64 {
        self.watermark
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.batches
            .iter()
            .flat_map(|b| b.records.iter())
            .chain(self.pending.iter())
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.len()).sum::<usize>() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sums over the captured records matching `pattern` inside `range`.
    pub fn sums(&self, pattern: &KeyPattern, range: &TimeRange) -> AggregateSums {
        let mut sums = AggregateSums::default();
        for record in self.records() {
            if pattern.matches(record) && range.contains(record.timestamp) {
                sums.add_record(record);
            }
        }
        sums
    }

    /// Like [`sums`](Self::sums), split per UTC day.
    pub fn daily_sums(&self, pattern: &KeyPattern, range: &TimeRange) -> BTreeMap<NaiveDate, AggregateSums> {
        let mut days: BTreeMap<NaiveDate, AggregateSums> = BTreeMap::new();
        for record in self.records() {
            if pattern.matches(record) && range.contains(record.timestamp) {
                days.entry(record.day()).or_default().add_record(record);
            }
        }
        days
    }
}

struct BufferState {
    pending: Vec<ProcessRecord>,
    sealed: VecDeque<Arc<FlushBatch>>,
    next_sequence: u64,
    flushing: Option<SharedFlush>,
    last_flush_at: Instant,
}

impl BufferState {
    fn buffered(&self) -> usize {
        self.pending.len() + self.sealed.iter().map(|b| b.len()).sum::<usize>()
    }

    fn watermark(&self) -> u64 {
        self.sealed
            .front()
            .and_then(|batch| batch.records.first())
            .or_else(|| self.pending.first())
            .map_or(self.next_sequence, |record| record.sequence)
    }

    fn seal(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.pending);
        let batch = FlushBatch::new(records, Utc::now());
        debug!(batch_id = %batch.id, records = batch.len(), "sealed batch");
        self.sealed.push_back(Arc::new(batch));
    }
}

#[derive(Default)]
struct Counters {
    flushed_batches: AtomicU64,
    flushed_records: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_records: AtomicU64,
    failed_attempts: AtomicU64,
}

struct Inner {
    config: BufferConfig,
    store: Arc<dyn DurableStore>,
    state: Mutex<BufferState>,
    observers: Mutex<Vec<Weak<dyn FlushObserver>>>,
    counters: Counters,
    shutdown: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the running flush, starting one if none is in flight.
    fn ensure_flush(self: &Arc<Self>, state: &mut BufferState) -> SharedFlush {
        if let Some(flush) = &state.flushing {
            return flush.clone();
        }

        let inner = Arc::clone(self);
        let flush = async move { inner.drain().await }.boxed().shared();
        state.flushing = Some(flush.clone());

        // Drive the flush on its own task so it completes even if every
        // caller awaiting it goes away.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let driver = flush.clone();
            handle.spawn(async move {
                let _ = driver.await;
            });
        }

        flush
    }

    async fn drain(self: Arc<Self>) -> FlushResult {
        let mut report = FlushReport::default();
        let mut first_failure = None;

        loop {
            let batch = {
                let mut state = self.lock_state();
                let front = state.sealed.front().cloned();
                match front {
                    Some(batch) => batch,
                    None => {
                        state.flushing = None;
                        state.last_flush_at = Instant::now();
                        break;
                    }
                }
            };

            let outcome = self.write_with_retry(&batch).await;
            self.remove_front(&batch);

            match outcome {
                Ok(retries) => {
                    report.batches += 1;
                    report.records += batch.len();
                    report.retries += retries;
                    self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .flushed_records
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(batch_id = %batch.id, records = batch.len(), retries, "batch committed");
                    self.notify(&batch).await;
                }
                Err(err) => {
                    self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .dropped_records
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    ENGINE_COUNTERS.record_dropped_batch(batch.len());
                    error!(batch_id = %batch.id, records = batch.len(), error = %err, "dropping batch");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn remove_front(&self, batch: &Arc<FlushBatch>) {
        let mut state = self.lock_state();
        if state.sealed.front().map_or(false, |front| Arc::ptr_eq(front, batch)) {
            state.sealed.pop_front();
        }
    }

    /// Writes one batch, retrying with exponential backoff. Returns the
    /// number of retries it took.
    async fn write_with_retry(&self, batch: &FlushBatch) -> Result<u32, FlushError> {
        let limit = self.config.flush_retry_limit;
        let mut attempt: u32 = 0;

        loop {
            let reason = match tokio::time::timeout(self.config.store_write_timeout, self.store.bulk_insert(batch)).await {
                Ok(Ok(true)) => return Ok(attempt),
                Ok(Ok(false)) => "store did not commit the batch".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("write timed out after {:?}", self.config.store_write_timeout),
            };

            self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
            ENGINE_COUNTERS.record_failed_flush_attempt();

            if attempt >= limit {
                return Err(FlushError::Fatal {
                    batch_id: batch.id,
                    records: batch.len(),
                    attempts: attempt + 1,
                    reason,
                });
            }

            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            let backoff = self.config.flush_retry_backoff_base.saturating_mul(factor);
            let failure = FlushError::Transient {
                batch_id: batch.id,
                attempt: attempt + 1,
                reason,
            };
            warn!(error = %failure, backoff_ms = backoff.as_millis() as u64, "flush attempt failed, retrying");

            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn notify(&self, batch: &FlushBatch) {
        let observers: Vec<Arc<dyn FlushObserver>> = {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_flush_committed(batch).await;
        }
    }

    /// Time left before the interval trigger fires.
    fn until_due(&self) -> Duration {
        let elapsed = self.lock_state().last_flush_at.elapsed();
        self.config.flush_interval.saturating_sub(elapsed)
    }
}

/// In-memory write-behind buffer in front of a [`DurableStore`].
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct WriteBehindBuffer {
    inner: Arc<Inner>,
}

impl WriteBehindBuffer {
    pub fn new(store: Arc<dyn DurableStore>, config: BufferConfig) -> Self {
        Self::starting_at(store, config, 0)
    }

    /// A buffer whose first admitted record gets `first_sequence`. Must be
    /// above every sequence already in the store.
    pub fn starting_at(store: Arc<dyn DurableStore>, config: BufferConfig, first_sequence: u64) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                state: Mutex::new(BufferState {
                    pending: Vec::new(),
                    sealed: VecDeque::new(),
                    next_sequence: first_sequence,
                    flushing: None,
                    last_flush_at: Instant::now(),
                }),
                observers: Mutex::new(Vec::new()),
                counters: Counters::default(),
                shutdown,
                flusher: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// Registers an observer. Only a weak reference is kept.
    pub fn register_observer(&self, observer: Weak<dyn FlushObserver>) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Buffers one record, overwriting its sequence with the next admission
    /// sequence. Fails only when the buffer holds `max_buffer_records`
    /// unflushed records already.
    pub fn add(&self, mut record: ProcessRecord) -> Result<Admission, BufferFullError> {
        let mut state = self.inner.lock_state();
        let buffered = state.buffered();
        let cap = self.inner.config.max_buffer_records;
        if buffered >= cap {
            return Err(BufferFullError { buffered, cap });
        }

        record.sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.push(record.clone());
        if state.pending.len() >= self.inner.config.batch_size {
            state.seal();
            let _ = self.inner.ensure_flush(&mut state);
        }

        Ok(Admission {
            position: buffered,
            record,
        })
    }

    /// Seals whatever is pending and waits for every sealed batch to be
    /// written. Joins the running flush if there is one.
    pub async fn flush_now(&self) -> FlushResult {
        let flush = {
            let mut state = self.inner.lock_state();
            state.seal();
            if state.sealed.is_empty() && state.flushing.is_none() {
                state.last_flush_at = Instant::now();
                return Ok(FlushReport::default());
            }
            self.inner.ensure_flush(&mut state)
        };
        flush.await
    }

    /// Waits for the running flush, if any, without sealing pending records.
    pub async fn wait_for_flush(&self) -> Option<FlushResult> {
        let flush = self.inner.lock_state().flushing.clone();
        match flush {
            Some(flush) => Some(flush.await),
            None => None,
        }
    }

    /// Copy-on-read view of every record not yet known to be durable.
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.inner.lock_state();
        BufferSnapshot {
            batches: state.sealed.iter().cloned().collect(),
            pending: state.pending.clone(),
            watermark: state.watermark(),
        }
    }

    pub fn stats(&self) -> BufferStats {
        let (pending_records, sealed_batches, sealed_records) = {
            let state = self.inner.lock_state();
            (
                state.pending.len(),
                state.sealed.len(),
                state.sealed.iter().map(|b| b.len()).sum(),
            )
        };
        let counters = &self.inner.counters;
        BufferStats {
            pending_records,
            sealed_batches,
            sealed_records,
            flushed_batches: counters.flushed_batches.load(Ordering::Relaxed),
            flushed_records: counters.flushed_records.load(Ordering::Relaxed),
            dropped_batches: counters.dropped_batches.load(Ordering::Relaxed),
            dropped_records: counters.dropped_records.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
        }
    }

    /// Starts the interval flusher. Calling it twice has no effect.
    pub fn start(&self) {
        let mut flusher = self.inner.flusher.lock().unwrap_or_else(|e| e.into_inner());
        if flusher.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.flush_interval;

        *flusher = Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "background flusher started");
            loop {
                let wait = match weak.upgrade() {
                    Some(inner) => inner.until_due(),
                    None => break,
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !inner.until_due().is_zero() {
                            continue;
                        }
                        let buffer = WriteBehindBuffer { inner };
                        if let Err(e) = buffer.flush_now().await {
                            warn!(error = %e, "interval flush failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("background flusher stopped");
        }));
    }

    /// Stops the flusher and flushes everything still buffered.
    pub async fn shutdown(&self) -> FlushResult {
        let _ = self.inner.shutdown.send(true);
        let handle = self
            .inner
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "background flusher ended abnormally");
            }
        }
        self.flush_now().await
    }
}
