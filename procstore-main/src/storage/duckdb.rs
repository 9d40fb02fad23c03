//! DuckDB durable store.
//!
//! Process records live in one wide table. Every committed flush batch also
//! leaves a row in a small ledger table inside the same transaction, which
//! is what makes replaying a batch after an ambiguous failure harmless.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! connection = ":memory:"  # or a database file path
//! options = { threads = "4" }
//! ```
//!
//! Statements run on the blocking pool while holding the connection lock,
//! so a caller that stops waiting (for example on a timeout) does not
//! interrupt a statement already in progress.

use crate::aggregation::{build_aggregate_query, AggregateSums, GroupStats, KeyPattern, TimeRange};
use crate::error::StoreError;
use crate::query::{QueryDescriptor, RecordOrder};
use crate::record::{millis_to_datetime, BatchId, FlushBatch, ProcessRecord, RecordId};
use crate::storage::DurableStore;
use async_trait::async_trait;
use chrono::Utc;
use duckdb::{params, Config, Connection, Row, ToSql};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const RECORDS_TABLE: &str = "process_records";

const RECORD_COLUMNS: &str = "record_id, sequence, batch_id, machine_id, machine_name, os_kind, \
     ts_millis, cpu_usage, mem_usage, process_name, pid, user_name, extra";

/// DuckDB-backed [`DurableStore`].
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Opens a store. `":memory:"` opens a private in-memory database.
    ///
    /// Recognised options: `threads`.
    pub fn new(connection_string: &str, options: &HashMap<String, String>) -> Result<Self, StoreError> {
        let mut config = Config::default();
        if let Some(threads) = options.get("threads") {
            let threads: i64 = threads
                .parse()
                .map_err(|_| StoreError::Connection(format!("Invalid threads option: {}", threads)))?;
            config = config
                .threads(threads)
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }

        let conn = if connection_string == ":memory:" {
            Connection::open_in_memory_with_flags(config)
        } else {
            Connection::open_with_flags(connection_string, config)
        }
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:", &HashMap::new())
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Whether a batch id is recorded in the ledger.
    pub async fn batch_committed(&self, batch_id: BatchId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let hits: i64 = conn.query_row(
                "SELECT COUNT(*) FROM flush_batches WHERE batch_id = ?",
                params![batch_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(hits > 0)
        })
        .await
    }
}

/// Parameterised WHERE clause under construction.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Filter {
    fn push(&mut self, clause: &str, value: impl ToSql + 'static) {
        self.clauses.push(clause.to_string());
        self.params.push(Box::new(value));
    }

    fn range(&mut self, range: &TimeRange) {
        self.push("ts_millis >= ?", range.start_millis());
        self.push("ts_millis < ?", range.end_millis());
    }

    fn pattern(&mut self, pattern: &KeyPattern) {
        if let Some(machine_id) = &pattern.machine_id {
            self.push("machine_id = ?", machine_id.clone());
        }
        if let Some(os_kind) = pattern.os_kind {
            self.push("os_kind = ?", os_kind.as_str().to_string());
        }
    }

    fn before_sequence(&mut self, bound: Option<u64>) -> Result<(), StoreError> {
        if let Some(bound) = bound {
            self.push("sequence < ?", to_i64(bound, "sequence bound")?);
        }
        Ok(())
    }

    fn descriptor(&mut self, descriptor: &QueryDescriptor) -> Result<(), StoreError> {
        self.range(&descriptor.time_range);
        self.pattern(&KeyPattern {
            machine_id: descriptor.machine_id.clone(),
            os_kind: descriptor.os_kind,
        });
        if let Some(name) = &descriptor.process_name {
            self.push("contains(lower(process_name), ?)", name.to_lowercase());
        }
        if let Some(cpu) = descriptor.cpu_usage_gt {
            self.push("cpu_usage > ?", cpu);
        }
        if let Some(mem) = descriptor.mem_usage_gt {
            self.push("mem_usage > ?", to_i64(mem, "mem_usage_gt")?);
        }
        Ok(())
    }

    fn where_clause(&self) -> String {
        self.clauses.join(" AND ")
    }

    fn refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Serialization(format!("{} {} exceeds BIGINT", what, value)))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Serialization(format!("negative {}: {}", what, value)))
}

fn decode_record(row: &Row<'_>) -> Result<ProcessRecord, StoreError> {
    let record_id: String = row.get(0)?;
    let os_kind: String = row.get(5)?;
    let extra: String = row.get(12)?;

    Ok(ProcessRecord {
        record_id: RecordId(Uuid::parse_str(&record_id).map_err(|e| StoreError::Serialization(e.to_string()))?),
        sequence: to_u64(row.get(1)?, "sequence")?,
        machine_id: row.get(3)?,
        machine_name: row.get(4)?,
        os_kind: os_kind.parse().map_err(StoreError::Serialization)?,
        timestamp: millis_to_datetime(row.get(6)?)?,
        cpu_usage: row.get(7)?,
        mem_usage: to_u64(row.get(8)?, "mem_usage")?,
        process_name: row.get(9)?,
        pid: row.get(10)?,
        user: row.get(11)?,
        extra: serde_json::from_str(&extra)?,
    })
}

/// ` LIMIT n OFFSET m` for the descriptor's paging, empty when unpaged.
fn paging(descriptor: &QueryDescriptor) -> String {
    let mut sql = String::new();
    if let Some(limit) = descriptor.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if descriptor.offset > 0 {
        sql.push_str(&format!(" OFFSET {}", descriptor.offset));
    }
    sql
}

fn decode_group(row: &Row<'_>, dimensions: usize) -> Result<GroupStats, StoreError> {
    let group = (0..dimensions)
        .map(|i| row.get::<_, Option<String>>(9 + i).map(Option::unwrap_or_default))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GroupStats {
        bucket_start: row.get(0)?,
        group,
        sums: AggregateSums {
            count: to_u64(row.get(1)?, "count")?,
            cpu_sum: row.get(2)?,
            mem_sum: row.get(3)?,
        },
        cpu_min: row.get(4)?,
        cpu_max: row.get(5)?,
        mem_min: row.get(6)?,
        mem_max: row.get(7)?,
        distinct_processes: to_u64(row.get(8)?, "distinct")?,
    })
}

#[async_trait]
impl DurableStore for DuckDbStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS process_records (
                    record_id VARCHAR NOT NULL,
                    sequence BIGINT NOT NULL,
                    batch_id VARCHAR NOT NULL,
                    machine_id VARCHAR NOT NULL,
                    machine_name VARCHAR,
                    os_kind VARCHAR NOT NULL,
                    ts_millis BIGINT NOT NULL,
                    cpu_usage DOUBLE NOT NULL,
                    mem_usage BIGINT NOT NULL,
                    process_name VARCHAR NOT NULL,
                    pid BIGINT,
                    user_name VARCHAR,
                    extra VARCHAR NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_records_machine_ts
                ON process_records(machine_id, ts_millis);

                CREATE INDEX IF NOT EXISTS idx_records_sequence
                ON process_records(sequence);

                CREATE TABLE IF NOT EXISTS flush_batches (
                    batch_id VARCHAR PRIMARY KEY,
                    record_count BIGINT NOT NULL,
                    committed_at BIGINT NOT NULL
                );
                "#,
            )
            .map_err(|e| StoreError::Query(format!("Failed to create tables: {}", e)))
        })
        .await
    }

    async fn bulk_insert(&self, batch: &FlushBatch) -> Result<bool, StoreError> {
        let batch_id = batch.id.to_string();
        let records = batch.records.clone();

        self.run(move |conn| {
            let tx = conn.transaction()?;

            let committed: i64 = tx.query_row(
                "SELECT COUNT(*) FROM flush_batches WHERE batch_id = ?",
                params![batch_id],
                |row| row.get(0),
            )?;
            if committed > 0 {
                debug!(batch_id = %batch_id, "batch already committed, skipping replay");
                return Ok(true);
            }

            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    RECORDS_TABLE, RECORD_COLUMNS
                ))?;

                for record in &records {
                    stmt.execute(params![
                        record.record_id.to_string(),
                        to_i64(record.sequence, "sequence")?,
                        batch_id,
                        record.machine_id,
                        record.machine_name,
                        record.os_kind.as_str(),
                        record.timestamp_millis(),
                        record.cpu_usage,
                        to_i64(record.mem_usage, "mem_usage")?,
                        record.process_name,
                        record.pid,
                        record.user,
                        serde_json::to_string(&record.extra)?,
                    ])?;
                }
            }

            tx.execute(
                "INSERT INTO flush_batches (batch_id, record_count, committed_at) VALUES (?, ?, ?)",
                params![batch_id, records.len() as i64, Utc::now().timestamp_millis()],
            )?;
            tx.commit()?;

            Ok(true)
        })
        .await
    }

    async fn query_aggregate(
        &self,
        pattern: &KeyPattern,
        range: &TimeRange,
        before_sequence: Option<u64>,
    ) -> Result<AggregateSums, StoreError> {
        let pattern = pattern.clone();
        let range = *range;

        self.run(move |conn| {
            let mut filter = Filter::default();
            filter.range(&range);
            filter.pattern(&pattern);
            filter.before_sequence(before_sequence)?;

            let sql = format!(
                "SELECT CAST(COUNT(*) AS BIGINT), \
                 CAST(COALESCE(SUM(cpu_usage), 0) AS DOUBLE), \
                 CAST(COALESCE(SUM(mem_usage), 0) AS DOUBLE) \
                 FROM {} WHERE {}",
                RECORDS_TABLE,
                filter.where_clause()
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(filter.refs().as_slice())?;
            match rows.next()? {
                Some(row) => Ok(AggregateSums {
                    count: to_u64(row.get(0)?, "count")?,
                    cpu_sum: row.get(1)?,
                    mem_sum: row.get(2)?,
                }),
                None => Ok(AggregateSums::default()),
            }
        })
        .await
    }

    async fn query_grouped(
        &self,
        descriptor: &QueryDescriptor,
        before_sequence: Option<u64>,
    ) -> Result<Vec<GroupStats>, StoreError> {
        let descriptor = descriptor.clone();

        self.run(move |conn| {
            let mut filter = Filter::default();
            filter.descriptor(&descriptor)?;
            filter.before_sequence(before_sequence)?;

            let mut sql = build_aggregate_query(
                RECORDS_TABLE,
                descriptor.granularity,
                &descriptor.group_by,
                &filter.where_clause(),
            );
            sql.push_str(&paging(&descriptor));
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(filter.refs().as_slice())?;

            let mut groups = Vec::new();
            while let Some(row) = rows.next()? {
                groups.push(decode_group(row, descriptor.group_by.len())?);
            }
            Ok(groups)
        })
        .await
    }

    async fn query_raw(&self, descriptor: &QueryDescriptor) -> Result<Vec<ProcessRecord>, StoreError> {
        let descriptor = descriptor.clone();

        self.run(move |conn| {
            let mut filter = Filter::default();
            filter.descriptor(&descriptor)?;

            let order = match descriptor.order {
                RecordOrder::Time => "ts_millis, sequence",
                RecordOrder::CpuDesc => "cpu_usage DESC, ts_millis, sequence",
                RecordOrder::MemDesc => "mem_usage DESC, ts_millis, sequence",
            };
            let mut sql = format!(
                "SELECT {} FROM {} WHERE {} ORDER BY {}",
                RECORD_COLUMNS,
                RECORDS_TABLE,
                filter.where_clause(),
                order
            );
            sql.push_str(&paging(&descriptor));

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(filter.refs().as_slice())?;

            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(decode_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", RECORDS_TABLE),
                params![],
                |row| row.get(0),
            )?;
            to_u64(count, "count")
        })
        .await
    }

    async fn next_sequence(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let next: i64 = conn.query_row(
                &format!("SELECT CAST(COALESCE(MAX(sequence) + 1, 0) AS BIGINT) FROM {}", RECORDS_TABLE),
                params![],
                |row| row.get(0),
            )?;
            to_u64(next, "sequence")
        })
        .await
    }
}
