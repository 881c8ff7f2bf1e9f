//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Queueing, batching and retry knobs for the coordinator.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    /// Items pulled per drain tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Minimum wait before a failed item becomes eligible again.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Hard bound on each queue; crossing 80% emits a backpressure warning.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_trade_drain_interval_ms")]
    pub trade_drain_interval_ms: u64,
    #[serde(default = "default_candle_drain_interval_ms")]
    pub candle_drain_interval_ms: u64,
    #[serde(default = "default_portfolio_drain_interval_ms")]
    pub portfolio_drain_interval_ms: u64,
    #[serde(default = "default_metrics_update_interval_ms")]
    pub metrics_update_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Capacity of each outbound broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

/// Hot-entity cache bounds.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Maximum entries per key-prefix partition before oldest-first eviction.
    #[serde(default = "default_max_cache_size")]
    pub max_entries: usize,
    #[serde(default = "default_cache_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

/// Inputs to the derived-metrics rollup.
#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    /// Fixed token supply used for market-cap derivation.
    #[serde(default = "default_total_supply")]
    pub total_supply: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_queue_size: default_max_queue_size(),
            trade_drain_interval_ms: default_trade_drain_interval_ms(),
            candle_drain_interval_ms: default_candle_drain_interval_ms(),
            portfolio_drain_interval_ms: default_portfolio_drain_interval_ms(),
            metrics_update_interval_ms: default_metrics_update_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_entries: default_max_cache_size(),
            cleanup_interval_ms: default_cache_cleanup_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            total_supply: default_total_supply(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/market.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_trade_drain_interval_ms() -> u64 {
    50
}

fn default_candle_drain_interval_ms() -> u64 {
    100
}

fn default_portfolio_drain_interval_ms() -> u64 {
    100
}

fn default_metrics_update_interval_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_max_cache_size() -> usize {
    1_000
}

fn default_cache_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_total_supply() -> u64 {
    1_000_000_000
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `URSA_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Variant of [`load_config`] that reads from an explicit directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("URSA")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn defaults_match_documented_cadences() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.trade_drain_interval_ms, 50);
        assert_eq!(config.candle_drain_interval_ms, 100);
        assert_eq!(config.metrics_update_interval_ms, 60_000);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("default.toml"),
            "[pipeline]\nbatch_size = 8\nmax_queue_size = 64\n",
        )
        .expect("write config");

        let config = load_config_from(dir.path(), None).expect("load config");
        assert_eq!(config.pipeline.batch_size, 8);
        assert_eq!(config.pipeline.max_queue_size, 64);
        assert_eq!(config.pipeline.max_retries, 3);
    }
}
