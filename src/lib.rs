//! procwatch: process-monitoring analysis over procstore
//!
//! This library accepts raw collector uploads (`ps`/`tasklist` output plus
//! machine metadata), turns them into process samples and answers
//! normalized history and real-time queries through the procstore engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use procwatch::{Analyzer, IngestRequest, MetaInfo, ParsedProcess, ProcessServiceImpl, QueryRequest, RecordParser, WatchSettings};
//! use procwatch::pipeline::BoxError;
//! use procstore_core::OsKind;
//!
//! // Example parser: one process per line, "name cpu mem"
//! struct LineParser;
//!
//! impl RecordParser for LineParser {
//!     fn parse(&self, content: &str, _os_kind: OsKind) -> Result<Vec<ParsedProcess>, BoxError> {
//!         content
//!             .lines()
//!             .map(|line| {
//!                 let mut fields = line.split_whitespace();
//!                 Ok(ParsedProcess {
//!                     process_name: fields.next().ok_or("missing name")?.to_string(),
//!                     pid: None,
//!                     cpu_usage: fields.next().ok_or("missing cpu")?.parse()?,
//!                     mem_usage: fields.next().ok_or("missing mem")?.parse()?,
//!                     user: None,
//!                     extra: Default::default(),
//!                 })
//!             })
//!             .collect()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     let settings = WatchSettings::new()?;
//!     let service = ProcessServiceImpl::new(&settings).await?;
//!     let analyzer = Analyzer::new(Box::new(LineParser), Box::new(service));
//!
//!     let summary = analyzer
//!         .ingest_raw(IngestRequest {
//!             os_type: Some("linux".to_string()),
//!             content: "sshd 0.5 4096\npostgres 12.0 524288".to_string(),
//!             meta_info: MetaInfo {
//!                 machine_id: Some("db-01".to_string()),
//!                 ..MetaInfo::default()
//!             },
//!         })
//!         .await?;
//!     println!("Ingested {} of {}", summary.accepted, summary.records_processed);
//!
//!     let response = analyzer
//!         .query(QueryRequest {
//!             machine_id: Some("db-01".to_string()),
//!             aggregations: Some(vec!["avg_cpu_usage".to_string()]),
//!             ..QueryRequest::default()
//!         })
//!         .await?;
//!     println!("{} rows from {}", response.total_count, response.source);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod service;
pub mod tests;

pub use config::{QuerySettings, WatchSettings};
pub use pipeline::{
    Analyzer,
    IngestRequest,
    IngestSummary,
    MetaInfo,
    ParsedProcess,
    ProcessService,
    QueryKind,
    QueryPolicy,
    QueryRequest,
    QueryResponse,
    RecordParser,
};
pub use service::ProcessServiceImpl;
