use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use procstore_core::aggregation::{start_of_day, GroupDimension, Granularity, Metric, TimeRange};
use procstore_core::engine::IngestAck;
use procstore_core::query::{QueryDescriptor, ResultRows, ResultSet, ResultSource};
use procstore_core::record::{OsKind, ProcessSample, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::QuerySettings;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One process as reported by a collector, before machine metadata is
/// attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedProcess {
    pub process_name: String,
    pub pid: Option<i64>,
    pub cpu_usage: f64,
    pub mem_usage: u64,
    pub user: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, ScalarValue>,
}

/// Turns raw collector output (`ps aux`, `tasklist`, ...) into processes.
pub trait RecordParser: Send + Sync {
    fn parse(&self, content: &str, os_kind: OsKind) -> Result<Vec<ParsedProcess>, BoxError>;
}

/// The engine as seen by the pipeline.
#[async_trait]
pub trait ProcessService: Send + Sync {
    async fn ingest(&self, sample: ProcessSample) -> Result<IngestAck, BoxError>;
    async fn query(&self, descriptor: QueryDescriptor) -> Result<ResultSet, BoxError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub meta_info: MetaInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub records_processed: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Whether a request targets history or only the current day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    #[default]
    Historical,
    RealTime,
}

/// Query parameters as accepted from API callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub os_type: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: QueryKind,
    pub machine_id: Option<String>,
    pub command: Option<String>,
    pub cpu_usage_gt: Option<f64>,
    pub memory_usage_gt: Option<f64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub aggregations: Option<Vec<String>>,
    /// Columns to group aggregations by (`machine_id`, `os_type`, `command`)
    pub group_by: Option<Vec<String>>,
    pub granularity: Option<Granularity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub total_count: usize,
    pub source: ResultSource,
    pub rows: ResultRows,
}

impl From<ResultSet> for QueryResponse {
    fn from(result: ResultSet) -> Self {
        Self {
            total_count: result.rows.len(),
            source: result.source,
            rows: result.rows,
        }
    }
}

/// Turns loosely specified requests into bounded query descriptors.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    pub default_window: Duration,
    pub max_window: Duration,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from(&QuerySettings::default())
    }
}

impl From<&QuerySettings> for QueryPolicy {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            default_window: Duration::days(settings.default_window_days as i64),
            max_window: Duration::days(settings.max_window_days as i64),
            default_limit: settings.default_limit,
            max_limit: settings.max_limit,
        }
    }
}

impl QueryPolicy {
    /// Normalizes `request` as of `now`.
    ///
    /// Missing bounds default to the window ending now, reversed bounds are
    /// swapped and the window is cut to `max_window` ending at its end.
    /// Requests without aggregations return raw records; with aggregations
    /// they return one row per metric and group. Either way `limit`/`offset`
    /// page the records or groups.
    pub fn normalize(&self, request: &QueryRequest, now: DateTime<Utc>) -> Result<QueryDescriptor, BoxError> {
        let end = request.end_time.unwrap_or(now);
        let start = request.start_time.unwrap_or(end - self.default_window);
        let mut range = TimeRange::new(start, end);
        if range.end - range.start > self.max_window {
            range = TimeRange::new(range.end - self.max_window, range.end);
        }
        if request.kind == QueryKind::RealTime {
            range = range.clipped_from(start_of_day(now.date_naive()));
        }

        let metrics = match &request.aggregations {
            Some(names) => ordered_metrics(names)?,
            None => Vec::new(),
        };

        let mut builder = QueryDescriptor::builder(range);
        if let Some(machine_id) = request.machine_id.as_deref().filter(|m| !m.is_empty()) {
            builder = builder.machine(machine_id);
        }
        if let Some(os_type) = &request.os_type {
            builder = builder.os_kind(os_type.parse::<OsKind>()?);
        }
        if let Some(command) = request.command.as_deref().filter(|c| !c.is_empty()) {
            builder = builder.process_name(command);
        }
        if let Some(cpu) = request.cpu_usage_gt {
            builder = builder.cpu_usage_gt(cpu.max(0.0));
        }
        if let Some(mem) = request.memory_usage_gt {
            builder = builder.mem_usage_gt(mem.max(0.0) as u64);
        }

        let group_by = request.group_by.as_deref().unwrap_or_default();
        if metrics.is_empty() {
            if !group_by.is_empty() {
                return Err("group_by requires aggregations".into());
            }
            builder = builder.records();
        } else {
            builder = builder
                .metrics(metrics)
                .granularity(request.granularity.unwrap_or(Granularity::Total));
            for name in group_by {
                builder = builder.group_by(name.parse::<GroupDimension>()?);
            }
        }

        let limit = match request.limit {
            Some(limit) if limit > 0 => (limit as usize).min(self.max_limit),
            _ => self.default_limit,
        };
        let offset = request.offset.unwrap_or(0).max(0) as usize;
        Ok(builder.limit(limit).offset(offset).build())
    }
}

/// Parses aggregation names, drops duplicates and orders them
/// count, sum, avg, min, max.
fn ordered_metrics(names: &[String]) -> Result<Vec<Metric>, BoxError> {
    let mut metrics: Vec<Metric> = Vec::with_capacity(names.len());
    for name in names {
        let metric: Metric = name.parse()?;
        if !metrics.contains(&metric) {
            metrics.push(metric);
        }
    }
    metrics.sort_by_key(|m| m.function());
    Ok(metrics)
}

pub struct Analyzer {
    parser: Box<dyn RecordParser>,
    service: Box<dyn ProcessService>,
    policy: QueryPolicy,
}

impl Analyzer {
    pub fn new(parser: Box<dyn RecordParser>, service: Box<dyn ProcessService>) -> Self {
        Self::with_policy(parser, service, QueryPolicy::default())
    }

    pub fn with_policy(parser: Box<dyn RecordParser>, service: Box<dyn ProcessService>, policy: QueryPolicy) -> Self {
        Self { parser, service, policy }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Parses one collector upload and ingests every process in it.
    ///
    /// Rejected samples are counted, not fatal; the upload as a whole fails
    /// only when it cannot be parsed.
    pub async fn ingest_raw(&self, request: IngestRequest) -> Result<IngestSummary, BoxError> {
        let os_type = match request.os_type.as_deref() {
            Some(os) if !os.trim().is_empty() && !request.content.trim().is_empty() => os,
            _ => return Err("Missing required fields: os_type and content".into()),
        };
        let os_kind: OsKind = os_type.parse()?;
        let machine_id = request
            .meta_info
            .machine_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or("Missing required field: meta_info.machine_id")?;
        let timestamp = request.meta_info.timestamp.unwrap_or_else(Utc::now);

        let processes = self.parser.parse(&request.content, os_kind)?;
        let mut summary = IngestSummary {
            records_processed: processes.len(),
            ..IngestSummary::default()
        };

        for process in processes {
            let sample = ProcessSample {
                machine_id: machine_id.clone(),
                machine_name: request.meta_info.machine_name.clone(),
                os_kind,
                timestamp,
                cpu_usage: process.cpu_usage,
                mem_usage: process.mem_usage,
                process_name: process.process_name,
                pid: process.pid,
                user: process.user,
                extra: process.extra,
            };
            match self.service.ingest(sample).await {
                Ok(_) => summary.accepted += 1,
                Err(e) => {
                    summary.rejected += 1;
                    warn!(machine_id = %machine_id, error = %e, "process sample rejected");
                }
            }
        }

        debug!(
            machine_id = %machine_id,
            processed = summary.records_processed,
            accepted = summary.accepted,
            "collector upload ingested"
        );
        Ok(summary)
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, BoxError> {
        let descriptor = self.policy.normalize(&request, Utc::now())?;
        let result = self.service.query(descriptor).await?;
        Ok(result.into())
    }
}
