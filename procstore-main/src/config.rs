//! Configuration management for the procstore engine.
//!
//! Settings are layered from several sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/procstore/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `PROCSTORE_`, nested keys joined
//!    with `__`, e.g. `PROCSTORE_ENGINE__BATCH_SIZE`)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.

use crate::buffer::BufferConfig;
use crate::maintainer::MaintainerConfig;
use clap::Parser;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/procstore/config.toml";

/// Command-line arguments parser.
///
/// Every storage and engine option can also be given through the
/// corresponding `PROCSTORE_*` environment variable.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Durable store engine type
    #[arg(long, env = "PROCSTORE_STORE")]
    store: Option<String>,

    /// Durable store connection string (file path or ":memory:")
    #[arg(long, env = "PROCSTORE_STORE_CONNECTION")]
    store_connection: Option<String>,

    /// Durable store options (key=value pairs)
    #[arg(long, env = "PROCSTORE_STORE_OPTIONS")]
    store_options: Option<Vec<String>>,

    /// Cache engine type
    #[arg(long, env = "PROCSTORE_CACHE")]
    cache: Option<String>,

    /// Seconds between sweeps of expired cache entries
    #[arg(long, env = "PROCSTORE_CACHE_SWEEP_INTERVAL")]
    cache_sweep_interval: Option<u64>,

    /// Records per flush batch
    #[arg(long, env = "PROCSTORE_BATCH_SIZE")]
    batch_size: Option<u64>,

    /// Seconds between interval flushes
    #[arg(long, env = "PROCSTORE_FLUSH_INTERVAL")]
    flush_interval: Option<u64>,

    /// Cap on buffered, unflushed records
    #[arg(long, env = "PROCSTORE_MAX_BUFFER_RECORDS")]
    max_buffer_records: Option<u64>,

    /// Store read deadline in seconds
    #[arg(long, env = "PROCSTORE_QUERY_TIMEOUT")]
    query_timeout: Option<u64>,

    /// Query descriptor (JSON) to run after ingesting stdin
    #[arg(long, value_name = "JSON")]
    query: Option<String>,
}

impl CliArgs {
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
}

/// Durable store backend.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Engine type; only "duckdb" is supported
    pub engine: String,
    /// File path, or ":memory:" for a private in-memory database
    pub connection: String,
    /// Engine-specific options (`threads`)
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: "duckdb".to_string(),
            connection: ":memory:".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Aggregate cache backend.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub engine: String,
    /// The cache is always private to one engine; only ":memory:" is supported
    pub connection: String,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            engine: "duckdb".to_string(),
            connection: ":memory:".to_string(),
            sweep_interval_secs: default_sweep_interval(),
            options: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Buffering, aggregate maintenance and query deadlines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub max_buffer_records: usize,
    pub flush_retry_limit: u32,
    pub flush_retry_backoff_base_ms: u64,
    pub store_write_timeout_secs: u64,
    pub aggregate_ttl_secs: u64,
    pub aggregate_max_age_secs: u64,
    pub rebuild_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_secs: 60,
            max_buffer_records: 100_000,
            flush_retry_limit: 5,
            flush_retry_backoff_base_ms: 200,
            store_write_timeout_secs: 30,
            aggregate_ttl_secs: 86_400,
            aggregate_max_age_secs: 3_600,
            rebuild_timeout_secs: 10,
            query_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            batch_size: self.batch_size.max(1),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_buffer_records: self.max_buffer_records,
            flush_retry_limit: self.flush_retry_limit,
            flush_retry_backoff_base: Duration::from_millis(self.flush_retry_backoff_base_ms),
            store_write_timeout: Duration::from_secs(self.store_write_timeout_secs),
        }
    }

    pub fn maintainer_config(&self) -> MaintainerConfig {
        MaintainerConfig {
            aggregate_ttl: Duration::from_secs(self.aggregate_ttl_secs),
            aggregate_max_age: Duration::from_secs(self.aggregate_max_age_secs),
            rebuild_timeout: Duration::from_secs(self.rebuild_timeout_secs),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Parses `key=value` pairs, skipping malformed entries.
fn parse_options(options: &[String]) -> HashMap<String, String> {
    options
        .iter()
        .filter_map(|opt| opt.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load default configuration
        builder = builder.add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml));

        // Load system configuration if it exists
        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        // Load user configuration if specified
        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PROCSTORE")
                .prefix_separator("_")
                .separator("__"),
        );

        // Store settings
        if let Some(ref engine) = cli.store {
            builder = builder.set_override("store.engine", engine.as_str())?;
        }
        if let Some(ref connection) = cli.store_connection {
            builder = builder.set_override("store.connection", connection.as_str())?;
        }
        if let Some(ref options) = cli.store_options {
            builder = builder.set_override("store.options", parse_options(options))?;
        }

        // Cache settings
        if let Some(ref engine) = cli.cache {
            builder = builder.set_override("cache.engine", engine.as_str())?;
        }
        if let Some(secs) = cli.cache_sweep_interval {
            builder = builder.set_override("cache.sweep_interval_secs", secs)?;
        }

        // Engine settings
        if let Some(size) = cli.batch_size {
            builder = builder.set_override("engine.batch_size", size)?;
        }
        if let Some(secs) = cli.flush_interval {
            builder = builder.set_override("engine.flush_interval_secs", secs)?;
        }
        if let Some(cap) = cli.max_buffer_records {
            builder = builder.set_override("engine.max_buffer_records", cap)?;
        }
        if let Some(secs) = cli.query_timeout {
            builder = builder.set_override("engine.query_timeout_secs", secs)?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_match_code_defaults() {
        let settings = Settings::new(&CliArgs::default()).unwrap();
        let defaults = EngineConfig::default();

        assert_eq!(settings.store.engine, "duckdb");
        assert_eq!(settings.cache.sweep_interval_secs, 60);
        assert_eq!(settings.engine.batch_size, defaults.batch_size);
        assert_eq!(settings.engine.aggregate_max_age_secs, defaults.aggregate_max_age_secs);
        assert_eq!(settings.engine.query_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn cli_overrides_file_values() {
        let cli = CliArgs::parse_from([
            "procstore",
            "--batch-size",
            "250",
            "--store-connection",
            "/tmp/procstore.db",
            "--store-options",
            "threads=2",
            "--query",
            "{}",
        ]);
        let settings = Settings::new(&cli).unwrap();

        assert_eq!(settings.engine.batch_size, 250);
        assert_eq!(settings.store.connection, "/tmp/procstore.db");
        assert_eq!(settings.store.options.get("threads").map(String::as_str), Some("2"));
        assert_eq!(cli.query(), Some("{}"));
    }

    #[test]
    fn engine_config_converts_units() {
        let engine = EngineConfig {
            flush_retry_backoff_base_ms: 50,
            batch_size: 0,
            ..EngineConfig::default()
        };
        let buffer = engine.buffer_config();
        assert_eq!(buffer.flush_retry_backoff_base, Duration::from_millis(50));
        assert_eq!(buffer.batch_size, 1);
        assert_eq!(engine.maintainer_config().aggregate_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn malformed_options_are_skipped() {
        let options = parse_options(&["threads=4".to_string(), "bogus".to_string()]);
        assert_eq!(options.len(), 1);
        assert_eq!(options["threads"], "4");
    }
}
