/*!
# procstore: write-behind process metrics with a cache-aware query router

procstore ingests process-monitoring records (CPU, memory and process
metadata from Unix and Windows hosts), persists them in an embedded DuckDB
store and answers aggregate and raw-record queries.

## Key Features

### Write-Behind Ingestion
- Records are acknowledged once buffered in memory and written to the store
  in batches, on size or on a timer
- Failed batches are retried with exponential backoff under the same batch
  id; the store's batch ledger makes a replayed batch a no-op
- A memory cap turns overload into an explicit `BufferFull` rejection

### Maintained Daily Aggregates
- Per machine, OS and UTC day: process count, average CPU and average memory,
  kept as sum and count so partial results merge exactly
- Incremented on ingestion, rebuilt from the store on a miss or when stale

### Query Routing
- Whole-day aggregate queries for one machine are answered from the cache
- Days from today on are read from the store plus the unflushed buffer
- Everything else (raw records, row filters, hourly buckets, extra group
  dimensions, top-N by CPU or memory) goes to the store
- An unreachable cache degrades the query to the store instead of failing it

## Usage

```rust,no_run
use procstore_core::aggregation::{Granularity, Metric, TimeRange};
use procstore_core::config::Settings;
use procstore_core::query::QueryDescriptor;
use procstore_core::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::default();
    settings.store.connection = "procstore.db".to_string();
    settings.engine.batch_size = 500;

    let engine = Engine::from_settings(&settings).await?;
    engine.start();

    let today = chrono::Utc::now().date_naive();
    let descriptor = QueryDescriptor::builder(TimeRange::day(today))
        .machine("build-01")
        .metrics([Metric::ProcessCount, Metric::AvgCpu])
        .granularity(Granularity::Daily)
        .build();
    let result = engine.query(&descriptor).await?;
    println!("{} rows from {}", result.rows.len(), result.source);

    engine.shutdown().await?;
    Ok(())
}
```

For detailed configuration options, see the [`config`](crate::config) module.
*/

pub mod aggregation;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod maintainer;
pub mod metrics;
pub mod query;
pub mod record;
pub mod router;
pub mod storage;

pub use aggregation::{AggregateKey, AggregateValue, GroupDimension, Granularity, Metric, TimeRange};
pub use buffer::{BufferConfig, WriteBehindBuffer};
pub use engine::{Engine, EngineStats, IngestAck};
pub use error::{BufferFullError, CacheError, FlushError, IngestError, QueryError, StoreError};
pub use query::{QueryDescriptor, RecordOrder, ResultSet, ResultSource};
pub use record::{OsKind, ProcessRecord, ProcessSample};
pub use storage::{CacheStore, DurableStore};
