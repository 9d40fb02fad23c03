//! Incrementally maintained per-day aggregates.
//!
//! Each aggregate key owns three cache entries:
//!
//! - `...:sum` and `...:count`: running sufficient statistics
//! - `...:updated`: epoch millis of the last refresh; present only once
//!   the entry has been rebuilt from the store ("primed")
//!
//! Ingestion increments `sum` and `count` blindly. Reads trust an entry only
//! when all three slots are present and the marker is younger than
//! `aggregate_max_age`; anything else is rebuilt from the store plus the
//! buffer snapshot.
//!
//! A rebuild overwrites `sum`/`count`, so an ingestion that runs concurrently
//! may be lost or counted twice. The [`ContributionTracker`] detects that
//! case and the rebuild then leaves the marker unwritten, so the next read
//! rebuilds again.

use crate::aggregation::{AggregateKey, AggregateSums, AggregateValue, KeyField, Metric};
use crate::buffer::{FlushObserver, WriteBehindBuffer};
use crate::clock::Clock;
use crate::error::{CacheError, QueryError};
use crate::metrics::ENGINE_COUNTERS;
use crate::record::{FlushBatch, ProcessRecord};
use crate::storage::{CacheStore, DurableStore, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MaintainerConfig {
    /// Lifetime of a primed entry
    pub aggregate_ttl: Duration,
    /// Staleness horizon: an older marker is treated as a miss
    pub aggregate_max_age: Duration,
    pub rebuild_timeout: Duration,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            aggregate_ttl: Duration::from_secs(86_400),
            aggregate_max_age: Duration::from_secs(3_600),
            rebuild_timeout: Duration::from_secs(10),
        }
    }
}

/// Counts ingestions between "record buffered" and "cache incremented".
#[derive(Debug, Default)]
pub struct ContributionTracker {
    started: AtomicU64,
    finished: AtomicU64,
}

/// Marks one ingestion in progress until dropped.
#[derive(Debug)]
pub struct ContributionGuard {
    tracker: Arc<ContributionTracker>,
}

impl Drop for ContributionGuard {
    fn drop(&mut self) {
        self.tracker.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracker readings taken when a rebuild starts.
#[derive(Debug, Clone, Copy)]
pub struct QuiescenceWindow {
    started: u64,
    idle_at_open: bool,
}

impl ContributionTracker {
    pub fn begin(self: &Arc<Self>) -> ContributionGuard {
        self.started.fetch_add(1, Ordering::SeqCst);
        ContributionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn open_window(&self) -> QuiescenceWindow {
        // finished first: it can only lag started, never overtake it
        let finished = self.finished.load(Ordering::SeqCst);
        let started = self.started.load(Ordering::SeqCst);
        QuiescenceWindow {
            started,
            idle_at_open: finished == started,
        }
    }

    /// True when nothing was in flight at `window` and nothing started since.
    pub fn quiescent_since(&self, window: QuiescenceWindow) -> bool {
        window.idle_at_open && self.started.load(Ordering::SeqCst) == window.started
    }

    pub fn in_flight(&self) -> u64 {
        let finished = self.finished.load(Ordering::SeqCst);
        self.started.load(Ordering::SeqCst).saturating_sub(finished)
    }
}

/// How a lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    Hit,
    Rebuilt,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lookup {
    pub value: AggregateValue,
    pub origin: LookupOrigin,
}

pub struct AggregationMaintainer {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn DurableStore>,
    buffer: WriteBehindBuffer,
    clock: Arc<dyn Clock>,
    tracker: Arc<ContributionTracker>,
    config: MaintainerConfig,
}

impl AggregationMaintainer {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn DurableStore>,
        buffer: WriteBehindBuffer,
        clock: Arc<dyn Clock>,
        config: MaintainerConfig,
    ) -> Self {
        Self {
            cache,
            store,
            buffer,
            clock,
            tracker: Arc::new(ContributionTracker::default()),
            config,
        }
    }

    pub fn config(&self) -> &MaintainerConfig {
        &self.config
    }

    /// Call before buffering a record and hold the guard until
    /// [`on_record_buffered`](Self::on_record_buffered) returns.
    pub fn begin_contribution(&self) -> ContributionGuard {
        self.tracker.begin()
    }

    pub fn tracker(&self) -> &Arc<ContributionTracker> {
        &self.tracker
    }

    fn fresh_expiry(&self, now: DateTime<Utc>) -> Expiry {
        let ttl = chrono::Duration::from_std(self.config.aggregate_ttl).unwrap_or(chrono::Duration::days(1));
        Expiry::At(now + ttl)
    }

    /// Adds the record to every maintained aggregate it belongs to.
    /// Failures never reach the caller: the key is invalidated instead.
    pub async fn on_record_buffered(&self, record: &ProcessRecord) {
        let expiry = self.fresh_expiry(self.clock.now());

        for key in AggregateKey::for_record(record) {
            let delta = key.contribution(record);
            let result = match self.cache.increment_by(&key.cache_key(KeyField::Sum), delta, expiry).await {
                Ok(_) => self
                    .cache
                    .increment_by(&key.cache_key(KeyField::Count), 1.0, expiry)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                ENGINE_COUNTERS.record_cache_failure();
                warn!(key = %key.cache_key(KeyField::Sum), error = %e, "aggregate increment failed, invalidating");
                if let Err(e) = self.invalidate(&key).await {
                    warn!(key = %key.cache_key(KeyField::Updated), error = %e, "invalidation failed");
                }
            }
        }
    }

    /// Cached value of `key`, or `None` when the entry is missing, partial,
    /// unprimed or stale.
    pub async fn get(&self, key: &AggregateKey) -> Result<Option<AggregateValue>, CacheError> {
        let marker = match self.cache.get(&key.cache_key(KeyField::Updated)).await? {
            Some(marker) => marker,
            None => return Ok(None),
        };
        let updated_at = match Utc.timestamp_millis_opt(marker as i64).single() {
            Some(at) => at,
            None => return Ok(None),
        };

        let max_age = chrono::Duration::from_std(self.config.aggregate_max_age).unwrap_or(chrono::Duration::zero());
        if self.clock.now() - updated_at > max_age {
            debug!(key = %key.cache_key(KeyField::Updated), "aggregate stale");
            return Ok(None);
        }

        let sum = self.cache.get(&key.cache_key(KeyField::Sum)).await?;
        let count = self.cache.get(&key.cache_key(KeyField::Count)).await?;
        match (sum, count) {
            (Some(sum), Some(count)) => Ok(Some(AggregateValue {
                sum,
                count: count.max(0.0).round() as u64,
                last_updated_at: updated_at,
            })),
            _ => Ok(None),
        }
    }

    /// Recomputes the value of `key`. See [`rebuild_sums`](Self::rebuild_sums).
    pub async fn rebuild(&self, key: &AggregateKey) -> Result<AggregateValue, QueryError> {
        let (sums, at) = self.rebuild_sums(key).await?;
        Ok(sums.value(key.metric, at))
    }

    /// Recomputes the day behind `key` from the store and the buffer and
    /// rewrites all maintained metrics of that day. Returns the sums and the
    /// instant they were taken.
    ///
    /// Cache write failures are logged; the recomputed sums are returned
    /// regardless.
    pub async fn rebuild_sums(&self, key: &AggregateKey) -> Result<(AggregateSums, DateTime<Utc>), QueryError> {
        let window = self.tracker.open_window();
        let snapshot = self.buffer.snapshot();
        let pattern = key.pattern();
        let range = key.range();

        let persisted = tokio::time::timeout(
            self.config.rebuild_timeout,
            self.store.query_aggregate(&pattern, &range, Some(snapshot.visible_below())),
        )
        .await
        .map_err(|_| QueryError::Timeout(self.config.rebuild_timeout))??;
        let sums = persisted.merge(&snapshot.sums(&pattern, &range));

        let now = self.clock.now();
        let expiry = self.fresh_expiry(now);
        let mut written = true;

        for metric in Metric::MAINTAINED {
            let entry = key.with_metric(metric);
            let value = sums.value(metric, now);
            let result = match self.cache.set_with_ttl(&entry.cache_key(KeyField::Sum), value.sum, expiry).await {
                Ok(_) => self
                    .cache
                    .set_with_ttl(&entry.cache_key(KeyField::Count), value.count as f64, expiry)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                written = false;
                ENGINE_COUNTERS.record_cache_failure();
                warn!(key = %entry.cache_key(KeyField::Sum), error = %e, "failed to store rebuilt aggregate");
            }
        }

        if written && self.tracker.quiescent_since(window) {
            for metric in Metric::MAINTAINED {
                let marker = key.with_metric(metric).cache_key(KeyField::Updated);
                if let Err(e) = self.cache.set_with_ttl(&marker, now.timestamp_millis() as f64, expiry).await {
                    ENGINE_COUNTERS.record_cache_failure();
                    warn!(key = %marker, error = %e, "failed to prime aggregate");
                }
            }
        } else {
            debug!(
                key = %key.cache_key(KeyField::Updated),
                "rebuild overlapped ingestion, leaving entry unprimed"
            );
        }

        Ok((sums, now))
    }

    /// Cached value if trusted, otherwise a rebuild. An unreachable cache
    /// counts as a miss.
    pub async fn get_or_rebuild(&self, key: &AggregateKey) -> Result<Lookup, QueryError> {
        match self.get(key).await {
            Ok(Some(value)) => {
                return Ok(Lookup {
                    value,
                    origin: LookupOrigin::Hit,
                })
            }
            Ok(None) => {}
            Err(e) => {
                ENGINE_COUNTERS.record_cache_failure();
                warn!(key = %key.cache_key(KeyField::Updated), error = %e, "cache read failed, rebuilding");
            }
        }

        let value = self.rebuild(key).await?;
        Ok(Lookup {
            value,
            origin: LookupOrigin::Rebuilt,
        })
    }

    /// Drops the entry so the next read rebuilds it. The marker goes first.
    pub async fn invalidate(&self, key: &AggregateKey) -> Result<(), CacheError> {
        self.cache.delete(&key.cache_key(KeyField::Updated)).await?;
        self.cache.delete(&key.cache_key(KeyField::Sum)).await?;
        self.cache.delete(&key.cache_key(KeyField::Count)).await?;
        Ok(())
    }
}

#[async_trait]
impl FlushObserver for AggregationMaintainer {
    /// Values were counted when buffered; only the markers of primed keys
    /// move forward.
    async fn on_flush_committed(&self, batch: &FlushBatch) {
        let keys: HashSet<AggregateKey> = batch
            .records
            .iter()
            .flat_map(AggregateKey::for_record)
            .collect();
        let now = self.clock.now().timestamp_millis() as f64;

        for key in keys {
            let marker = key.cache_key(KeyField::Updated);
            if let Err(e) = self.cache.set_with_ttl(&marker, now, Expiry::Keep).await {
                ENGINE_COUNTERS.record_cache_failure();
                warn!(key = %marker, error = %e, "failed to refresh aggregate marker");
            }
        }
    }
}
