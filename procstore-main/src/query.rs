//! Query descriptors and result sets.

use crate::aggregation::{GroupDimension, Granularity, Metric, TimeRange};
use crate::error::QueryError;
use crate::record::{OsKind, ProcessRecord};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// What a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    Aggregates,
    Records,
}

/// Row order of record queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrder {
    /// Timestamp, then admission order
    #[default]
    Time,
    /// Highest CPU usage first
    CpuDesc,
    /// Highest memory usage first
    MemDesc,
}

/// Caller-built, immutable query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub time_range: TimeRange,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub os_kind: Option<OsKind>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    pub granularity: Granularity,
    /// Extra grouping columns for aggregate queries; store only
    #[serde(default)]
    pub group_by: Vec<GroupDimension>,
    pub output: QueryOutput,
    #[serde(default)]
    pub order: RecordOrder,
    /// Case-insensitive substring match on the process name
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub cpu_usage_gt: Option<f64>,
    #[serde(default)]
    pub mem_usage_gt: Option<u64>,
    /// Cap on records, or on aggregate groups (bucket and group values)
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl QueryDescriptor {
    pub fn builder(time_range: TimeRange) -> QueryDescriptorBuilder {
        QueryDescriptorBuilder {
            descriptor: QueryDescriptor {
                time_range,
                machine_id: None,
                os_kind: None,
                metrics: Vec::new(),
                granularity: Granularity::Total,
                group_by: Vec::new(),
                output: QueryOutput::Aggregates,
                order: RecordOrder::Time,
                process_name: None,
                cpu_usage_gt: None,
                mem_usage_gt: None,
                limit: None,
                offset: 0,
            },
        }
    }

    /// Row-level predicates beyond the key dimensions.
    pub fn has_row_filters(&self) -> bool {
        self.process_name.is_some() || self.cpu_usage_gt.is_some() || self.mem_usage_gt.is_some()
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.time_range.is_empty() {
            return Err(QueryError::InvalidDescriptor("time range is empty".to_string()));
        }
        if self.output == QueryOutput::Aggregates && self.metrics.is_empty() {
            return Err(QueryError::InvalidDescriptor(
                "aggregate query requests no metrics".to_string(),
            ));
        }
        if self.output == QueryOutput::Records && !self.group_by.is_empty() {
            return Err(QueryError::InvalidDescriptor(
                "group_by applies to aggregate queries only".to_string(),
            ));
        }
        if self.output == QueryOutput::Aggregates && self.order != RecordOrder::Time {
            return Err(QueryError::InvalidDescriptor(
                "record order applies to record queries only".to_string(),
            ));
        }
        if let Some(cpu) = self.cpu_usage_gt {
            if !cpu.is_finite() {
                return Err(QueryError::InvalidDescriptor(format!("cpu_usage_gt {} is not finite", cpu)));
            }
        }
        Ok(())
    }
}

pub struct QueryDescriptorBuilder {
    descriptor: QueryDescriptor,
}

impl QueryDescriptorBuilder {
    pub fn machine(mut self, machine_id: impl Into<String>) -> Self {
        self.descriptor.machine_id = Some(machine_id.into());
        self
    }

    pub fn os_kind(mut self, os_kind: OsKind) -> Self {
        self.descriptor.os_kind = Some(os_kind);
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        if !self.descriptor.metrics.contains(&metric) {
            self.descriptor.metrics.push(metric);
        }
        self
    }

    pub fn metrics(self, metrics: impl IntoIterator<Item = Metric>) -> Self {
        metrics.into_iter().fold(self, |b, m| b.metric(m))
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.descriptor.granularity = granularity;
        self
    }

    pub fn group_by(mut self, dimension: GroupDimension) -> Self {
        if !self.descriptor.group_by.contains(&dimension) {
            self.descriptor.group_by.push(dimension);
        }
        self
    }

    pub fn records(mut self) -> Self {
        self.descriptor.output = QueryOutput::Records;
        self
    }

    pub fn order(mut self, order: RecordOrder) -> Self {
        self.descriptor.order = order;
        self
    }

    /// The `n` heaviest records by `order`, e.g. the top CPU consumers of a
    /// day when combined with a day range and an OS filter.
    pub fn top(self, order: RecordOrder, n: usize) -> Self {
        self.records().order(order).limit(n)
    }

    pub fn process_name(mut self, pattern: impl Into<String>) -> Self {
        self.descriptor.process_name = Some(pattern.into());
        self
    }

    pub fn cpu_usage_gt(mut self, threshold: f64) -> Self {
        self.descriptor.cpu_usage_gt = Some(threshold);
        self
    }

    pub fn mem_usage_gt(mut self, threshold: u64) -> Self {
        self.descriptor.mem_usage_gt = Some(threshold);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.descriptor.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.descriptor.offset = offset;
        self
    }

    pub fn build(self) -> QueryDescriptor {
        self.descriptor
    }
}

/// Where a result set was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Cache,
    Store,
    Hybrid,
}

impl Display for ResultSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultSource::Cache => write!(f, "cache"),
            ResultSource::Store => write!(f, "store"),
            ResultSource::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// One metric value for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Bucket start; `None` for whole-range rows
    pub bucket: Option<DateTime<Utc>>,
    /// Group dimension values when the query grouped by any
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group: BTreeMap<GroupDimension, String>,
    pub metric: Metric,
    /// `None` when the bucket holds no records and the metric is a mean or extreme
    pub value: Option<f64>,
    pub sample_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum ResultRows {
    Aggregates(Vec<AggregateRow>),
    Records(Vec<ProcessRecord>),
}

impl ResultRows {
    pub fn len(&self) -> usize {
        match self {
            ResultRows::Aggregates(rows) => rows.len(),
            ResultRows::Records(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub rows: ResultRows,
    pub source: ResultSource,
    pub as_of: DateTime<Utc>,
}

impl ResultSet {
    pub fn aggregates(&self) -> &[AggregateRow] {
        match &self.rows {
            ResultRows::Aggregates(rows) => rows,
            ResultRows::Records(_) => &[],
        }
    }

    pub fn records(&self) -> &[ProcessRecord] {
        match &self.rows {
            ResultRows::Records(rows) => rows,
            ResultRows::Aggregates(_) => &[],
        }
    }

    /// First value of `metric`, in bucket order.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.aggregates()
            .iter()
            .find(|row| row.metric == metric)
            .and_then(|row| row.value)
    }

    /// Exports the rows as an Arrow batch.
    pub fn to_record_batch(&self) -> Result<RecordBatch, crate::error::StoreError> {
        match &self.rows {
            ResultRows::Records(records) => crate::record::create_record_batch(records),
            ResultRows::Aggregates(rows) => {
                let schema = Schema::new(vec![
                    Field::new("bucket", DataType::Int64, true),
                    Field::new("group", DataType::Utf8, true),
                    Field::new("metric", DataType::Utf8, false),
                    Field::new("value", DataType::Float64, true),
                    Field::new("sample_count", DataType::UInt64, false),
                ]);
                let arrays: Vec<ArrayRef> = vec![
                    Arc::new(Int64Array::from(
                        rows.iter()
                            .map(|r| r.bucket.map(|b| b.timestamp_millis()))
                            .collect::<Vec<_>>(),
                    )),
                    Arc::new(StringArray::from(
                        rows.iter().map(|r| group_label(&r.group)).collect::<Vec<_>>(),
                    )),
                    Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.metric.as_str()))),
                    Arc::new(Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>())),
                    Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.sample_count))),
                ];
                RecordBatch::try_new(Arc::new(schema), arrays).map_err(|e| {
                    crate::error::StoreError::Serialization(format!(
                        "Failed to create result batch: {}",
                        e
                    ))
                })
            }
        }
    }
}

/// `dimension=value` pairs joined by commas, `None` when ungrouped.
fn group_label(group: &BTreeMap<GroupDimension, String>) -> Option<String> {
    if group.is_empty() {
        return None;
    }
    Some(
        group
            .iter()
            .map(|(dimension, value)| format!("{}={}", dimension, value))
            .collect::<Vec<_>>()
            .join(","),
    )
}
