//! procstore replay binary.
//!
//! Reads newline-delimited JSON process samples from stdin, ingests them,
//! flushes, and optionally answers one query.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (prefixed with `PROCSTORE_`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/procstore/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! ## Command-line Options
//!
//! ```text
//! Options:
//!   -c, --config <FILE>                  Path to configuration file
//!       --store <TYPE>                   Durable store engine type [env: PROCSTORE_STORE]
//!       --store-connection <STR>         Store connection string [env: PROCSTORE_STORE_CONNECTION]
//!       --store-options <KEY=VAL>        Store options [env: PROCSTORE_STORE_OPTIONS]
//!       --cache <TYPE>                   Cache engine type [env: PROCSTORE_CACHE]
//!       --cache-sweep-interval <SECS>    Expired entry sweep interval [env: PROCSTORE_CACHE_SWEEP_INTERVAL]
//!       --batch-size <N>                 Records per flush batch [env: PROCSTORE_BATCH_SIZE]
//!       --flush-interval <SECS>          Interval flush period [env: PROCSTORE_FLUSH_INTERVAL]
//!       --max-buffer-records <N>         Buffer cap [env: PROCSTORE_MAX_BUFFER_RECORDS]
//!       --query-timeout <SECS>           Store read deadline [env: PROCSTORE_QUERY_TIMEOUT]
//!       --query <JSON>                   Query descriptor to run after ingesting
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Load a day of samples into a file-backed store
//! procstore --store-connection /var/lib/procstore/data.db < samples.ndjson
//!
//! # Load and ask for the daily average CPU of one machine
//! procstore --query '{"time_range":{"start":"2024-05-10T00:00:00Z","end":"2024-05-11T00:00:00Z"},
//!   "machine_id":"build-01","metrics":["avg_cpu"],"granularity":"daily","output":"aggregates"}' < samples.ndjson
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::Parser;
use procstore_core::{
    config::{CliArgs, Settings},
    Engine, ProcessSample, QueryDescriptor,
};
use std::io::BufRead;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli_args = CliArgs::parse();
    let settings = Settings::new(&cli_args)?;

    // Parse the query up front so a typo fails before any ingestion
    let descriptor: Option<QueryDescriptor> = cli_args.query().map(serde_json::from_str).transpose()?;

    let engine = Engine::from_settings(&settings).await?;
    engine.start();

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for (line_no, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: ProcessSample = match serde_json::from_str(&line) {
            Ok(sample) => sample,
            Err(e) => {
                rejected += 1;
                warn!(line = line_no + 1, error = %e, "skipping malformed sample");
                continue;
            }
        };
        match engine.ingest(sample).await {
            Ok(_) => accepted += 1,
            Err(e) => {
                rejected += 1;
                warn!(line = line_no + 1, error = %e, "sample rejected");
            }
        }
    }
    info!(accepted, rejected, "input ingested");

    engine.flush_now().await?;

    if let Some(descriptor) = descriptor {
        let result = engine.query(&descriptor).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    engine.shutdown().await?;
    Ok(())
}
