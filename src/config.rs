//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `TURNSTILE` using `__` between
//! nesting levels (`TURNSTILE__ENGINE__TOP_N=5`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Path to a YAML rules file loaded at startup
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the cleaner sweeps idle counters, in milliseconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Oldest statistics event kept, in milliseconds
    #[serde(default = "default_stats_retention")]
    pub stats_retention_ms: u64,

    /// Width of the time buckets statistics are aggregated into
    #[serde(default = "default_stats_bucket")]
    pub stats_bucket_ms: u64,

    /// Distinct keys each bucket tracks per blocked ranking
    #[serde(default = "default_max_ranked_keys")]
    pub max_ranked_keys: usize,

    /// Buffer size of the limit-exceeded broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Length of the top-blocked rankings in statistics snapshots
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            stats_retention_ms: default_stats_retention(),
            stats_bucket_ms: default_stats_bucket(),
            max_ranked_keys: default_max_ranked_keys(),
            event_channel_capacity: default_event_channel_capacity(),
            top_n: default_top_n(),
        }
    }
}

impl EngineConfig {
    /// Cleaner tick period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_stats_retention() -> u64 {
    86_400_000
}

fn default_stats_bucket() -> u64 {
    1_000
}

fn default_max_ranked_keys() -> usize {
    10_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_top_n() -> usize {
    10
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.cleanup_interval_ms == 0 {
            return Err(TurnstileError::Config(
                "engine.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.engine.stats_bucket_ms == 0 {
            return Err(TurnstileError::Config(
                "engine.stats_bucket_ms must be greater than zero".to_string(),
            ));
        }
        if self.engine.event_channel_capacity == 0 {
            return Err(TurnstileError::Config(
                "engine.event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.engine.top_n == 0 {
            return Err(TurnstileError::Config(
                "engine.top_n must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
