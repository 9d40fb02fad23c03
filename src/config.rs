use config::{Config, ConfigError, Environment, File};
use procstore_core::config::{CacheConfig, EngineConfig, Settings, StoreConfig};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchSettings {
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Normalization limits for incoming query requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_window_days: u32,
    pub max_window_days: u32,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_window_days: 30,
            max_window_days: 365,
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

impl WatchSettings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = Path::new("config");

        let builder = Config::builder()
            // Start with default settings
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables, e.g. PROCWATCH_ENGINE__BATCH_SIZE
            .add_source(Environment::with_prefix("PROCWATCH").prefix_separator("_").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// The engine's view of these settings.
    pub fn engine_settings(&self) -> Settings {
        Settings {
            store: self.store.clone(),
            cache: self.cache.clone(),
            engine: self.engine.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn setup() {
        INIT.call_once(|| {
            std::env::set_var("PROCWATCH_ENGINE__BATCH_SIZE", "250");
        });
    }

    #[test]
    fn test_default_settings() {
        let settings = WatchSettings::default();
        assert_eq!(settings.store.engine, "duckdb");
        assert_eq!(settings.query.max_limit, 1000);
        assert_eq!(settings.engine.batch_size, 1000);
    }

    #[test]
    fn test_environment_override() {
        setup();
        let settings = WatchSettings::new().unwrap();
        assert_eq!(settings.engine.batch_size, 250);
        assert_eq!(settings.engine_settings().engine.batch_size, 250);
    }
}
