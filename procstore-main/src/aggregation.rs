//! Aggregation vocabulary shared by the store, the cache and the router.
//!
//! Aggregates are kept as sufficient statistics (sum and count) and only
//! turned into averages when read, so partial aggregates from different
//! sources can be merged exactly:
//! `(sum_a + sum_b) / (count_a + count_b)`.

use crate::record::{OsKind, ProcessRecord};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const MILLIS_PER_HOUR: i64 = 3_600_000;
const MILLIS_PER_DAY: i64 = 86_400_000;

/// Metrics a query may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ProcessCount,
    AvgCpu,
    AvgMem,
    TotalCpu,
    TotalMem,
    MaxCpu,
    MinCpu,
    MaxMem,
    MinMem,
    /// Number of distinct process names
    DistinctProcesses,
}

impl Metric {
    /// Metrics that own an entry in the aggregate cache.
    pub const MAINTAINED: [Metric; 3] = [Metric::ProcessCount, Metric::AvgCpu, Metric::AvgMem];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::ProcessCount => "process_count",
            Metric::AvgCpu => "avg_cpu",
            Metric::AvgMem => "avg_mem",
            Metric::TotalCpu => "total_cpu",
            Metric::TotalMem => "total_mem",
            Metric::MaxCpu => "max_cpu",
            Metric::MinCpu => "min_cpu",
            Metric::MaxMem => "max_mem",
            Metric::MinMem => "min_mem",
            Metric::DistinctProcesses => "distinct_processes",
        }
    }

    /// The maintained metric whose cached sum/count answers this metric,
    /// or `None` when only the store can answer it.
    pub fn maintained_basis(&self) -> Option<Metric> {
        match self {
            Metric::ProcessCount => Some(Metric::ProcessCount),
            Metric::AvgCpu | Metric::TotalCpu => Some(Metric::AvgCpu),
            Metric::AvgMem | Metric::TotalMem => Some(Metric::AvgMem),
            _ => None,
        }
    }

    /// The aggregation family, used to order requested metrics.
    pub fn function(&self) -> AggregateFunction {
        match self {
            Metric::ProcessCount | Metric::DistinctProcesses => AggregateFunction::Count,
            Metric::TotalCpu | Metric::TotalMem => AggregateFunction::Sum,
            Metric::AvgCpu | Metric::AvgMem => AggregateFunction::Avg,
            Metric::MinCpu | Metric::MinMem => AggregateFunction::Min,
            Metric::MaxCpu | Metric::MaxMem => AggregateFunction::Max,
        }
    }

    /// Reads this metric out of a maintained aggregate value.
    pub fn from_value(&self, value: &AggregateValue) -> Option<f64> {
        match self {
            Metric::ProcessCount => Some(value.count as f64),
            Metric::AvgCpu | Metric::AvgMem => value.mean(),
            Metric::TotalCpu | Metric::TotalMem => Some(value.sum),
            _ => None,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    /// Accepts both the engine's names and the HTTP API's aggregation
    /// names (`total_cpu_usage`, `avg_memory_usage`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let metric = match s.trim().to_ascii_lowercase().as_str() {
            "process_count" | "count" => Metric::ProcessCount,
            "avg_cpu" | "avg_cpu_usage" => Metric::AvgCpu,
            "avg_mem" | "avg_mem_usage" | "avg_memory_usage" => Metric::AvgMem,
            "total_cpu" | "total_cpu_usage" | "sum_cpu_usage" => Metric::TotalCpu,
            "total_mem" | "total_memory_usage" | "sum_mem_usage" => Metric::TotalMem,
            "max_cpu" | "max_cpu_usage" => Metric::MaxCpu,
            "min_cpu" | "min_cpu_usage" => Metric::MinCpu,
            "max_mem" | "max_mem_usage" | "max_memory_usage" => Metric::MaxMem,
            "min_mem" | "min_mem_usage" | "min_memory_usage" => Metric::MinMem,
            "distinct_processes" | "count_command" => Metric::DistinctProcesses,
            other => return Err(format!("Unknown metric: {}", other)),
        };
        Ok(metric)
    }
}

/// Generic aggregation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateFunction::Count => write!(f, "COUNT"),
            AggregateFunction::Sum => write!(f, "SUM"),
            AggregateFunction::Avg => write!(f, "AVG"),
            AggregateFunction::Min => write!(f, "MIN"),
            AggregateFunction::Max => write!(f, "MAX"),
        }
    }
}

/// Bucket size of aggregate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One row per metric for the whole range
    Total,
    /// One row per UTC calendar day; the shape the cache maintains
    Daily,
    /// One row per hour; store only
    Hourly,
}

impl Granularity {
    /// Bucket width in milliseconds, `None` for a single bucket.
    pub fn bucket_millis(&self) -> Option<i64> {
        match self {
            Granularity::Total => None,
            Granularity::Daily => Some(MILLIS_PER_DAY),
            Granularity::Hourly => Some(MILLIS_PER_HOUR),
        }
    }

    /// Start of the bucket containing `timestamp_millis`.
    pub fn bucket_start(&self, timestamp_millis: i64) -> Option<i64> {
        self.bucket_millis()
            .map(|size| timestamp_millis - timestamp_millis.rem_euclid(size))
    }
}

/// Record columns a store-side aggregate can additionally group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupDimension {
    MachineId,
    OsKind,
    ProcessName,
}

impl GroupDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupDimension::MachineId => "machine_id",
            GroupDimension::OsKind => "os_kind",
            GroupDimension::ProcessName => "process_name",
        }
    }

    /// Column of the records table holding this dimension.
    pub fn column(&self) -> &'static str {
        self.as_str()
    }
}

impl Display for GroupDimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupDimension {
    type Err = String;

    /// Also accepts the HTTP API's column names (`os_type`, `command`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "machine_id" | "machine" => Ok(GroupDimension::MachineId),
            "os_kind" | "os_type" | "os" => Ok(GroupDimension::OsKind),
            "process_name" | "command" => Ok(GroupDimension::ProcessName),
            other => Err(format!("Unknown group_by dimension: {}", other)),
        }
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

impl TimeRange {
    /// Builds a range, swapping the bounds when they arrive reversed.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// The whole of one UTC day.
    pub fn day(day: NaiveDate) -> Self {
        Self::days(day, day)
    }

    /// Whole UTC days from `first` through `last`, both inclusive.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        Self::new(start_of_day(first), start_of_day(last) + Duration::days(1))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when both bounds sit on UTC midnight.
    pub fn is_day_aligned(&self) -> bool {
        self.start == start_of_day(self.start.date_naive())
            && self.end == start_of_day(self.end.date_naive())
    }

    /// Every calendar day the range touches, in order.
    pub fn covered_days(&self) -> Vec<NaiveDate> {
        if self.is_empty() {
            return Vec::new();
        }
        let first = self.start.date_naive();
        let last = (self.end - Duration::milliseconds(1)).date_naive();
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    /// Restricts the range to `[from, end)`.
    pub fn clipped_from(&self, from: DateTime<Utc>) -> Self {
        Self {
            start: self.start.max(from),
            end: self.end.max(from),
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Cache identity of one maintained aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub machine_id: String,
    pub os_kind: OsKind,
    pub date: NaiveDate,
    pub metric: Metric,
}

/// Which cache slot of an aggregate entry a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    Sum,
    Count,
    /// Epoch millis of the last refresh; its presence marks the entry primed
    Updated,
}

impl AggregateKey {
    pub fn new(machine_id: impl Into<String>, os_kind: OsKind, date: NaiveDate, metric: Metric) -> Self {
        Self {
            machine_id: machine_id.into(),
            os_kind,
            date,
            metric,
        }
    }

    /// Keys a record contributes to, one per maintained metric.
    pub fn for_record(record: &ProcessRecord) -> [AggregateKey; 3] {
        Metric::MAINTAINED.map(|metric| {
            AggregateKey::new(record.machine_id.clone(), record.os_kind, record.day(), metric)
        })
    }

    pub fn with_metric(&self, metric: Metric) -> Self {
        Self {
            metric,
            ..self.clone()
        }
    }

    /// Cache key for one slot. The machine id is length-prefixed since it
    /// may itself contain `:`.
    pub fn cache_key(&self, field: KeyField) -> String {
        let suffix = match field {
            KeyField::Sum => "sum",
            KeyField::Count => "count",
            KeyField::Updated => "updated",
        };
        format!(
            "agg:{}:{}:{}:{}:{}:{}",
            self.machine_id.len(),
            self.machine_id,
            self.os_kind,
            self.date.format("%Y-%m-%d"),
            self.metric,
            suffix
        )
    }

    /// How much one record adds to this key's sum.
    pub fn contribution(&self, record: &ProcessRecord) -> f64 {
        match self.metric {
            Metric::AvgCpu => record.cpu_usage,
            Metric::AvgMem => record.mem_usage as f64,
            _ => 1.0,
        }
    }

    /// The store scope that recomputes this key.
    pub fn pattern(&self) -> KeyPattern {
        KeyPattern {
            machine_id: Some(self.machine_id.clone()),
            os_kind: Some(self.os_kind),
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::day(self.date)
    }
}

/// Store-side selector: `None` matches every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    pub machine_id: Option<String>,
    pub os_kind: Option<OsKind>,
}

impl KeyPattern {
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        self.machine_id.as_ref().map_or(true, |m| *m == record.machine_id)
            && self.os_kind.map_or(true, |os| os == record.os_kind)
    }
}

/// Sufficient statistics for one aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateValue {
    pub sum: f64,
    pub count: u64,
    pub last_updated_at: DateTime<Utc>,
}

impl AggregateValue {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            last_updated_at: at,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    /// Combines two partial aggregates. The horizon is the older of the two.
    pub fn merge(&self, other: &AggregateValue) -> AggregateValue {
        AggregateValue {
            sum: self.sum + other.sum,
            count: self.count + other.count,
            last_updated_at: self.last_updated_at.min(other.last_updated_at),
        }
    }
}

/// Sums over a set of records for all maintained metrics at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSums {
    pub count: u64,
    pub cpu_sum: f64,
    pub mem_sum: f64,
}

impl AggregateSums {
    pub fn add_record(&mut self, record: &ProcessRecord) {
        self.count += 1;
        self.cpu_sum += record.cpu_usage;
        self.mem_sum += record.mem_usage as f64;
    }

    pub fn merge(&self, other: &AggregateSums) -> AggregateSums {
        AggregateSums {
            count: self.count + other.count,
            cpu_sum: self.cpu_sum + other.cpu_sum,
            mem_sum: self.mem_sum + other.mem_sum,
        }
    }

    /// The maintained value for `metric` as of `at`.
    pub fn value(&self, metric: Metric, at: DateTime<Utc>) -> AggregateValue {
        let sum = match metric.maintained_basis() {
            Some(Metric::AvgCpu) => self.cpu_sum,
            Some(Metric::AvgMem) => self.mem_sum,
            _ => self.count as f64,
        };
        AggregateValue {
            sum,
            count: self.count,
            last_updated_at: at,
        }
    }
}

/// One bucket of a store-side grouped aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Bucket start in epoch millis; `None` for a whole-range aggregate
    pub bucket_start: Option<i64>,
    /// Values of the requested group dimensions, in request order
    #[serde(default)]
    pub group: Vec<String>,
    pub sums: AggregateSums,
    pub cpu_min: Option<f64>,
    pub cpu_max: Option<f64>,
    pub mem_min: Option<f64>,
    pub mem_max: Option<f64>,
    pub distinct_processes: u64,
}

impl GroupStats {
    pub fn metric_value(&self, metric: Metric) -> Option<f64> {
        let count = self.sums.count;
        match metric {
            Metric::ProcessCount => Some(count as f64),
            Metric::AvgCpu => (count > 0).then(|| self.sums.cpu_sum / count as f64),
            Metric::AvgMem => (count > 0).then(|| self.sums.mem_sum / count as f64),
            Metric::TotalCpu => Some(self.sums.cpu_sum),
            Metric::TotalMem => Some(self.sums.mem_sum),
            Metric::MaxCpu => self.cpu_max,
            Metric::MinCpu => self.cpu_min,
            Metric::MaxMem => self.mem_max,
            Metric::MinMem => self.mem_min,
            Metric::DistinctProcesses => Some(self.distinct_processes as f64),
        }
    }
}

/// Builds the grouped statistics query over the records table.
///
/// Every bucket returns the same leading column list so one row decoder
/// serves all granularities:
/// `bucket, count, cpu_sum, mem_sum, cpu_min, cpu_max, mem_min, mem_max, distinct`,
/// followed by one text column per entry of `group_by`.
/// The WHERE clause is passed in pre-built with `?` placeholders.
pub fn build_aggregate_query(
    table_name: &str,
    granularity: Granularity,
    group_by: &[GroupDimension],
    where_clause: &str,
) -> String {
    let bucket = match granularity.bucket_millis() {
        Some(size) => format!("ts_millis - (ts_millis % {})", size),
        None => "CAST(NULL AS BIGINT)".to_string(),
    };

    let mut query = format!(
        "SELECT {bucket} AS bucket, \
         CAST(COUNT(*) AS BIGINT), \
         CAST(COALESCE(SUM(cpu_usage), 0) AS DOUBLE), \
         CAST(COALESCE(SUM(mem_usage), 0) AS DOUBLE), \
         CAST(MIN(cpu_usage) AS DOUBLE), \
         CAST(MAX(cpu_usage) AS DOUBLE), \
         CAST(MIN(mem_usage) AS DOUBLE), \
         CAST(MAX(mem_usage) AS DOUBLE), \
         CAST(COUNT(DISTINCT process_name) AS BIGINT)"
    );
    for dimension in group_by {
        query.push_str(&format!(", CAST({} AS VARCHAR)", dimension.column()));
    }
    query.push_str(&format!(" FROM {table_name}"));

    if !where_clause.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(where_clause);
    }

    let mut keys: Vec<&str> = Vec::new();
    if granularity.bucket_millis().is_some() {
        keys.push("bucket");
    }
    keys.extend(group_by.iter().map(|d| d.column()));
    if !keys.is_empty() {
        let keys = keys.join(", ");
        query.push_str(&format!(" GROUP BY {keys} ORDER BY {keys}"));
    }

    query
}
