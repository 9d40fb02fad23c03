//! Process records and their Arrow representation.

use crate::error::StoreError;
use arrow_array::{
    Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Operating system family a record was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    #[serde(alias = "linux", alias = "mac", alias = "darwin")]
    Unix,
    #[serde(alias = "win")]
    Windows,
}

impl OsKind {
    pub const ALL: [OsKind; 2] = [OsKind::Unix, OsKind::Windows];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsKind::Unix => "unix",
            OsKind::Windows => "windows",
        }
    }
}

impl Display for OsKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unix" | "linux" | "mac" | "darwin" => Ok(OsKind::Unix),
            "windows" | "win" => Ok(OsKind::Windows),
            other => Err(format!("Unsupported OS type: {}", other)),
        }
    }
}

/// A scalar value in a record's open `extra` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Identifier assigned to a record when it is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one flush batch; the unit of idempotence in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Parser output: one observed process, not yet admitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub machine_id: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    pub os_kind: OsKind,
    pub timestamp: DateTime<Utc>,
    /// CPU usage in percent, 0.0 to 100.0
    pub cpu_usage: f64,
    /// Resident memory in bytes
    pub mem_usage: u64,
    pub process_name: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, ScalarValue>,
}

impl ProcessSample {
    /// Checks the invariants a sample must satisfy before it is buffered.
    pub fn validate(&self) -> Result<(), String> {
        if self.machine_id.trim().is_empty() {
            return Err("machine_id must not be empty".to_string());
        }
        if self.process_name.trim().is_empty() {
            return Err("process_name must not be empty".to_string());
        }
        if !self.cpu_usage.is_finite() || !(0.0..=100.0).contains(&self.cpu_usage) {
            return Err(format!("cpu_usage {} outside 0-100", self.cpu_usage));
        }
        Ok(())
    }
}

/// An admitted, immutable process record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub record_id: RecordId,
    /// Admission order across all callers of one engine
    pub sequence: u64,
    pub machine_id: String,
    pub machine_name: Option<String>,
    pub os_kind: OsKind,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub mem_usage: u64,
    pub process_name: String,
    pub pid: Option<i64>,
    pub user: Option<String>,
    pub extra: BTreeMap<String, ScalarValue>,
}

impl ProcessRecord {
    pub fn from_sample(sample: ProcessSample, sequence: u64) -> Self {
        Self {
            record_id: RecordId::new(),
            sequence,
            machine_id: sample.machine_id,
            machine_name: sample.machine_name,
            os_kind: sample.os_kind,
            timestamp: sample.timestamp,
            cpu_usage: sample.cpu_usage,
            mem_usage: sample.mem_usage,
            process_name: sample.process_name,
            pid: sample.pid,
            user: sample.user,
            extra: sample.extra,
        }
    }

    /// UTC calendar day the record belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Converts epoch milliseconds back into a UTC instant.
pub fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("Invalid timestamp {}", millis)))
}

/// The records swapped out of the buffer for one flush cycle.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub id: BatchId,
    pub records: Vec<ProcessRecord>,
    pub sealed_at: DateTime<Utc>,
}

impl FlushBatch {
    pub fn new(records: Vec<ProcessRecord>, sealed_at: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new(),
            records,
            sealed_at,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Gets the schema for process records in Arrow format.
pub fn records_schema() -> Schema {
    Schema::new(vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("sequence", DataType::UInt64, false),
        Field::new("machine_id", DataType::Utf8, false),
        Field::new("machine_name", DataType::Utf8, true),
        Field::new("os_kind", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("cpu_usage", DataType::Float64, false),
        Field::new("mem_usage", DataType::UInt64, false),
        Field::new("process_name", DataType::Utf8, false),
        Field::new("pid", DataType::Int64, true),
        Field::new("user", DataType::Utf8, true),
        Field::new("extra", DataType::Utf8, false),
    ])
}

/// Creates a RecordBatch from a slice of ProcessRecords.
pub fn create_record_batch(records: &[ProcessRecord]) -> Result<RecordBatch, StoreError> {
    let extras = records
        .iter()
        .map(|r| serde_json::to_string(&r.extra))
        .collect::<Result<Vec<_>, _>>()?;

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.record_id.to_string()),
        )),
        Arc::new(UInt64Array::from_iter_values(records.iter().map(|r| r.sequence))),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.machine_id.as_str()))),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.machine_name.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.os_kind.as_str()))),
        Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.timestamp_millis()))),
        Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.cpu_usage))),
        Arc::new(UInt64Array::from_iter_values(records.iter().map(|r| r.mem_usage))),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.process_name.as_str()))),
        Arc::new(Int64Array::from(records.iter().map(|r| r.pid).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.user.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(extras)),
    ];

    RecordBatch::try_new(Arc::new(records_schema()), arrays)
        .map_err(|e| StoreError::Serialization(format!("Failed to create record batch: {}", e)))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StoreError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| StoreError::Serialization(format!("Invalid {} column", name)))
}

fn optional_string(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

/// Decodes a RecordBatch produced by [`create_record_batch`].
pub fn decode_record_batch(batch: &RecordBatch) -> Result<Vec<ProcessRecord>, StoreError> {
    let ids = column::<StringArray>(batch, "record_id")?;
    let sequences = column::<UInt64Array>(batch, "sequence")?;
    let machine_ids = column::<StringArray>(batch, "machine_id")?;
    let machine_names = column::<StringArray>(batch, "machine_name")?;
    let os_kinds = column::<StringArray>(batch, "os_kind")?;
    let timestamps = column::<Int64Array>(batch, "timestamp")?;
    let cpu = column::<Float64Array>(batch, "cpu_usage")?;
    let mem = column::<UInt64Array>(batch, "mem_usage")?;
    let names = column::<StringArray>(batch, "process_name")?;
    let pids = column::<Int64Array>(batch, "pid")?;
    let users = column::<StringArray>(batch, "user")?;
    let extras = column::<StringArray>(batch, "extra")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let record_id = Uuid::parse_str(ids.value(i))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        records.push(ProcessRecord {
            record_id: RecordId(record_id),
            sequence: sequences.value(i),
            machine_id: machine_ids.value(i).to_string(),
            machine_name: optional_string(machine_names, i),
            os_kind: os_kinds.value(i).parse().map_err(StoreError::Serialization)?,
            timestamp: millis_to_datetime(timestamps.value(i))?,
            cpu_usage: cpu.value(i),
            mem_usage: mem.value(i),
            process_name: names.value(i).to_string(),
            pid: if pids.is_null(i) { None } else { Some(pids.value(i)) },
            user: optional_string(users, i),
            extra: serde_json::from_str(extras.value(i))?,
        });
    }

    Ok(records)
}
