//! Query routing between the aggregate cache and the durable store.
//!
//! A descriptor is served from maintained aggregates only when its shape
//! matches them exactly: one machine, whole UTC days, daily or total
//! granularity, no row filters or extra group dimensions and only metrics
//! derivable from sum/count. Everything else goes to the store. Days from
//! today on are never read from the cache: they come from the store plus a
//! buffer snapshot, with the store read cut at the snapshot's sequence
//! watermark so each record is counted once.
//!
//! Aggregate `limit`/`offset` count groups, not rows: each group yields one
//! row per requested metric.

use crate::aggregation::{
    start_of_day, AggregateKey, AggregateSums, AggregateValue, Granularity, KeyPattern, Metric,
    TimeRange,
};
use crate::buffer::WriteBehindBuffer;
use crate::clock::Clock;
use crate::error::{QueryError, StoreError};
use crate::maintainer::AggregationMaintainer;
use crate::metrics::ENGINE_COUNTERS;
use crate::query::{AggregateRow, QueryDescriptor, QueryOutput, ResultRows, ResultSet, ResultSource};
use crate::record::{millis_to_datetime, OsKind};
use crate::storage::DurableStore;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why a descriptor cannot be answered from maintained aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReason {
    RawRecords,
    RowFilters,
    GroupDimensions,
    UnmaintainedMetric,
    NoMachine,
    Granularity,
    UnalignedRange,
}

impl Display for StoreReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            StoreReason::RawRecords => "raw records requested",
            StoreReason::RowFilters => "row filters present",
            StoreReason::GroupDimensions => "grouped by record dimensions",
            StoreReason::UnmaintainedMetric => "metric not maintained",
            StoreReason::NoMachine => "no machine filter",
            StoreReason::Granularity => "granularity not maintained",
            StoreReason::UnalignedRange => "range not aligned to whole days",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    StoreOnly(StoreReason),
    /// Every day is before today
    CacheOnly { days: Vec<NaiveDate> },
    /// Days before today from the cache, the rest from store and buffer
    Hybrid {
        cached_days: Vec<NaiveDate>,
        live_days: Vec<NaiveDate>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub descriptor: QueryDescriptor,
    pub route: Route,
}

/// Decides how to serve `descriptor` given the current UTC day.
pub fn route(descriptor: &QueryDescriptor, today: NaiveDate) -> Result<QueryPlan, QueryError> {
    descriptor.validate()?;

    let store_reason = if descriptor.output == QueryOutput::Records {
        Some(StoreReason::RawRecords)
    } else if descriptor.has_row_filters() {
        Some(StoreReason::RowFilters)
    } else if !descriptor.group_by.is_empty() {
        Some(StoreReason::GroupDimensions)
    } else if descriptor.metrics.iter().any(|m| m.maintained_basis().is_none()) {
        Some(StoreReason::UnmaintainedMetric)
    } else if descriptor.machine_id.is_none() {
        Some(StoreReason::NoMachine)
    } else if descriptor.granularity == Granularity::Hourly {
        Some(StoreReason::Granularity)
    } else if !descriptor.time_range.is_day_aligned() {
        Some(StoreReason::UnalignedRange)
    } else {
        None
    };

    let route = match store_reason {
        Some(reason) => Route::StoreOnly(reason),
        None => {
            let (live_days, cached_days): (Vec<NaiveDate>, Vec<NaiveDate>) = descriptor
                .time_range
                .covered_days()
                .into_iter()
                .partition(|day| *day >= today);
            if live_days.is_empty() {
                Route::CacheOnly { days: cached_days }
            } else {
                Route::Hybrid {
                    cached_days,
                    live_days,
                }
            }
        }
    };

    Ok(QueryPlan {
        descriptor: descriptor.clone(),
        route,
    })
}

/// Per-day values of the maintained basis metrics.
type DayValues = BTreeMap<NaiveDate, HashMap<Metric, AggregateValue>>;

fn add_value(values: &mut DayValues, day: NaiveDate, basis: Metric, value: AggregateValue) {
    values
        .entry(day)
        .or_default()
        .entry(basis)
        .and_modify(|existing| *existing = existing.merge(&value))
        .or_insert(value);
}

fn basis_metrics(metrics: &[Metric]) -> Vec<Metric> {
    let mut bases = Vec::new();
    for basis in metrics.iter().filter_map(|m| m.maintained_basis()) {
        if !bases.contains(&basis) {
            bases.push(basis);
        }
    }
    bases
}

fn aggregate_row(bucket: Option<DateTime<Utc>>, metric: Metric, value: &AggregateValue) -> AggregateRow {
    AggregateRow {
        bucket,
        group: BTreeMap::new(),
        metric,
        value: metric.from_value(value),
        sample_count: value.count,
    }
}

/// Applies the descriptor's group paging to rows laid out as consecutive
/// runs of one row per metric.
fn page_groups(rows: Vec<AggregateRow>, descriptor: &QueryDescriptor) -> Vec<AggregateRow> {
    let per_group = descriptor.metrics.len().max(1);
    let take = descriptor
        .limit
        .map_or(usize::MAX, |limit| limit.saturating_mul(per_group));
    rows.into_iter()
        .skip(descriptor.offset.saturating_mul(per_group))
        .take(take)
        .collect()
}

/// Turns per-day basis values into result rows for the descriptor's
/// granularity. Days without records produce no daily rows.
fn maintained_rows(descriptor: &QueryDescriptor, values: &DayValues, as_of: DateTime<Utc>) -> Vec<AggregateRow> {
    let lookup = |day_values: &HashMap<Metric, AggregateValue>, metric: Metric| {
        metric
            .maintained_basis()
            .and_then(|basis| day_values.get(&basis).copied())
            .unwrap_or_else(|| AggregateValue::empty(as_of))
    };

    match descriptor.granularity {
        Granularity::Daily | Granularity::Hourly => {
            let mut rows = Vec::new();
            for (day, day_values) in values {
                if day_values.values().all(|v| v.count == 0) {
                    continue;
                }
                for metric in &descriptor.metrics {
                    rows.push(aggregate_row(Some(start_of_day(*day)), *metric, &lookup(day_values, *metric)));
                }
            }
            rows
        }
        Granularity::Total => {
            let mut totals: HashMap<Metric, AggregateValue> = HashMap::new();
            for day_values in values.values() {
                for (basis, value) in day_values {
                    totals
                        .entry(*basis)
                        .and_modify(|existing| *existing = existing.merge(value))
                        .or_insert(*value);
                }
            }
            descriptor
                .metrics
                .iter()
                .map(|metric| aggregate_row(None, *metric, &lookup(&totals, *metric)))
                .collect()
        }
    }
}

pub struct QueryRouter {
    store: Arc<dyn DurableStore>,
    buffer: WriteBehindBuffer,
    maintainer: Arc<AggregationMaintainer>,
    clock: Arc<dyn Clock>,
    query_timeout: Duration,
}

impl QueryRouter {
    pub fn new(
        store: Arc<dyn DurableStore>,
        buffer: WriteBehindBuffer,
        maintainer: Arc<AggregationMaintainer>,
        clock: Arc<dyn Clock>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            store,
            buffer,
            maintainer,
            clock,
            query_timeout,
        }
    }

    pub fn route(&self, descriptor: &QueryDescriptor) -> Result<QueryPlan, QueryError> {
        route(descriptor, self.clock.today())
    }

    /// Routes and executes in one step.
    pub async fn query(&self, descriptor: &QueryDescriptor) -> Result<ResultSet, QueryError> {
        let plan = self.route(descriptor)?;
        self.execute(plan).await
    }

    pub async fn execute(&self, plan: QueryPlan) -> Result<ResultSet, QueryError> {
        let as_of = self.clock.now();
        debug!(route = ?plan.route, "executing query plan");

        match &plan.route {
            Route::StoreOnly(reason) => {
                debug!(%reason, "serving from store");
                self.execute_store(&plan.descriptor, as_of).await
            }
            Route::CacheOnly { days } => self.execute_maintained(&plan.descriptor, days, &[], as_of).await,
            Route::Hybrid {
                cached_days,
                live_days,
            } => {
                self.execute_maintained(&plan.descriptor, cached_days, live_days, as_of)
                    .await
            }
        }
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, QueryError> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| QueryError::Timeout(self.query_timeout))?
            .map_err(QueryError::from)
    }

    async fn execute_store(&self, descriptor: &QueryDescriptor, as_of: DateTime<Utc>) -> Result<ResultSet, QueryError> {
        let rows = match descriptor.output {
            QueryOutput::Records => ResultRows::Records(self.with_timeout(self.store.query_raw(descriptor)).await?),
            QueryOutput::Aggregates => {
                let groups = self.with_timeout(self.store.query_grouped(descriptor, None)).await?;
                let mut rows = Vec::with_capacity(groups.len() * descriptor.metrics.len());
                for group in &groups {
                    let bucket = group.bucket_start.map(millis_to_datetime).transpose()?;
                    let values: BTreeMap<_, _> = descriptor
                        .group_by
                        .iter()
                        .copied()
                        .zip(group.group.iter().cloned())
                        .collect();
                    for metric in &descriptor.metrics {
                        rows.push(AggregateRow {
                            bucket,
                            group: values.clone(),
                            metric: *metric,
                            value: group.metric_value(*metric),
                            sample_count: group.sums.count,
                        });
                    }
                }
                ResultRows::Aggregates(rows)
            }
        };

        Ok(ResultSet {
            rows,
            source: ResultSource::Store,
            as_of,
        })
    }

    /// Per-day sums from the store plus the buffer snapshot, never touching
    /// the cache.
    async fn live_sums(
        &self,
        machine_id: &str,
        os_kind: Option<OsKind>,
        range: TimeRange,
    ) -> Result<BTreeMap<NaiveDate, AggregateSums>, QueryError> {
        let snapshot = self.buffer.snapshot();

        let mut descriptor = QueryDescriptor::builder(range)
            .machine(machine_id)
            .metric(Metric::ProcessCount)
            .granularity(Granularity::Daily)
            .build();
        descriptor.os_kind = os_kind;

        let groups = self
            .with_timeout(self.store.query_grouped(&descriptor, Some(snapshot.visible_below())))
            .await?;
        let pattern = KeyPattern {
            machine_id: Some(machine_id.to_string()),
            os_kind,
        };
        let mut days = snapshot.daily_sums(&pattern, &range);
        for group in groups {
            let Some(bucket) = group.bucket_start else { continue };
            let day = millis_to_datetime(bucket)?.date_naive();
            let entry = days.entry(day).or_default();
            *entry = entry.merge(&group.sums);
        }
        Ok(days)
    }

    async fn execute_maintained(
        &self,
        descriptor: &QueryDescriptor,
        cached_days: &[NaiveDate],
        live_days: &[NaiveDate],
        as_of: DateTime<Utc>,
    ) -> Result<ResultSet, QueryError> {
        let machine_id = descriptor
            .machine_id
            .clone()
            .ok_or_else(|| QueryError::InvalidDescriptor("cache route requires a machine".to_string()))?;
        let os_kinds: Vec<OsKind> = match descriptor.os_kind {
            Some(os) => vec![os],
            None => OsKind::ALL.to_vec(),
        };
        let bases = basis_metrics(&descriptor.metrics);

        let mut values = DayValues::new();
        let mut hits = 0usize;
        let mut misses: BTreeMap<(NaiveDate, OsKind), Vec<Metric>> = BTreeMap::new();

        for day in cached_days {
            for os in &os_kinds {
                for basis in &bases {
                    let key = AggregateKey::new(machine_id.clone(), *os, *day, *basis);
                    match self.maintainer.get(&key).await {
                        Ok(Some(value)) => {
                            hits += 1;
                            add_value(&mut values, *day, *basis, value);
                        }
                        Ok(None) => misses.entry((*day, *os)).or_default().push(*basis),
                        Err(e) => {
                            ENGINE_COUNTERS.record_degraded_query();
                            warn!(error = %e, machine_id = %machine_id, "cache unavailable, serving from store");
                            return self.execute_degraded(descriptor, &machine_id, as_of).await;
                        }
                    }
                }
            }
        }

        let rebuilt = misses.len();
        for ((day, os), missing) in misses {
            let key = AggregateKey::new(machine_id.clone(), os, day, missing[0]);
            let (sums, at) = self.maintainer.rebuild_sums(&key).await?;
            for basis in missing {
                add_value(&mut values, day, basis, sums.value(basis, at));
            }
        }

        if let (Some(first), Some(last)) = (live_days.first(), live_days.last()) {
            let live = self
                .live_sums(&machine_id, descriptor.os_kind, TimeRange::days(*first, *last))
                .await?;
            for (day, sums) in live {
                for basis in &bases {
                    add_value(&mut values, day, *basis, sums.value(*basis, as_of));
                }
            }
        }

        let source = if !live_days.is_empty() {
            ResultSource::Hybrid
        } else if rebuilt == 0 {
            ResultSource::Cache
        } else if hits == 0 {
            ResultSource::Store
        } else {
            ResultSource::Hybrid
        };
        debug!(%source, hits, rebuilt, "maintained query served");

        Ok(ResultSet {
            rows: ResultRows::Aggregates(page_groups(maintained_rows(descriptor, &values, as_of), descriptor)),
            source,
            as_of,
        })
    }

    /// The maintained path with the cache taken out: every day comes from
    /// the store plus the buffer snapshot.
    async fn execute_degraded(
        &self,
        descriptor: &QueryDescriptor,
        machine_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<ResultSet, QueryError> {
        let bases = basis_metrics(&descriptor.metrics);
        let mut values = DayValues::new();
        let days = self
            .live_sums(machine_id, descriptor.os_kind, descriptor.time_range)
            .await?;
        for (day, sums) in days {
            for basis in &bases {
                add_value(&mut values, day, *basis, sums.value(*basis, as_of));
            }
        }

        Ok(ResultSet {
            rows: ResultRows::Aggregates(page_groups(maintained_rows(descriptor, &values, as_of), descriptor)),
            source: ResultSource::Store,
            as_of,
        })
    }
}
