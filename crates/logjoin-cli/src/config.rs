//! Configuration file support for logjoin
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! # Join timeouts
//! join:
//!   session_idle_timeout_secs: 1800
//!   max_query_click_delay_secs: 900
//!   default_tenant: shop
//!
//! # Periodic flush passes
//! sweep:
//!   interval_secs: 500
//!
//! # Output
//! output:
//!   path: /var/log/logjoin/joined.jsonl
//!   dead_letter_path: /var/log/logjoin/rejected.jsonl
//!
//! # Logging settings
//! logging:
//!   level: info
//!   format: json
//! ```

use logjoin_runtime::{BackpressureStrategy, FlushPolicy, IngestPoolConfig, JoinConfig, SweepConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Join timeouts and switches
    pub join: JoinSection,

    /// Periodic flush configuration
    pub sweep: SweepSection,

    /// Ingestion worker pool
    pub ingest: IngestSection,

    /// Where joined records go
    pub output: OutputSection,

    /// Feature store cache used with `join.enable_cache`
    pub feature_cache: FeatureCacheSection,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JoinSection {
    /// Idle time after which a whole session is flushed
    pub session_idle_timeout_secs: u64,

    /// Time a query waits for clicks before it is flushed on its own
    pub max_query_click_delay_secs: u64,

    /// Decide everything but never write to the output
    pub dry_run: bool,

    /// Enrich item visits from the feature store
    pub enable_cache: bool,

    /// Tenant for input lines that do not carry one
    pub default_tenant: String,
}

impl Default for JoinSection {
    fn default() -> Self {
        Self {
            session_idle_timeout_secs: 1800,
            max_query_click_delay_secs: 900,
            dry_run: false,
            enable_cache: false,
            default_tenant: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepSection {
    /// Run periodic flush passes
    pub enabled: bool,

    /// Seconds between flush passes
    pub interval_secs: u64,

    /// Move the stream clock to wall clock time before each pass
    pub advance_to_wall_clock: bool,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 500,
            advance_to_wall_clock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestSection {
    /// Number of worker tasks
    pub workers: usize,

    /// Maximum queue size per worker
    pub queue_size: usize,

    /// What to do when a queue is full
    pub backpressure: BackpressureStrategy,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1000,
            backpressure: BackpressureStrategy::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OutputSection {
    /// JSON lines output file (stdout when not set)
    pub path: Option<PathBuf>,

    /// Pretty-print console output
    pub pretty: bool,

    /// File receiving every rejected line
    pub dead_letter_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureCacheSection {
    pub ttl_secs: u64,
    pub max_entries: usize,

    /// JSON lines feature table loaded into a static store
    pub path: Option<PathBuf>,
}

impl Default for FeatureCacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 100_000,
            path: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MetricsSection {
    /// Collect Prometheus metrics
    pub enabled: bool,

    /// Write the final metrics dump here
    pub stats_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content)?,
            "toml" => Self::from_toml(&content)?,
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject settings the join cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join.session_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "join.session_idle_timeout_secs must be positive".into(),
            ));
        }
        if self.join.max_query_click_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "join.max_query_click_delay_secs must be positive".into(),
            ));
        }
        if self.join.max_query_click_delay_secs > self.join.session_idle_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "join.max_query_click_delay_secs ({}) exceeds join.session_idle_timeout_secs ({})",
                self.join.max_query_click_delay_secs, self.join.session_idle_timeout_secs
            )));
        }
        if self.join.default_tenant.is_empty() {
            return Err(ConfigError::Invalid("join.default_tenant must not be empty".into()));
        }
        if self.sweep.enabled && self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep.interval_secs must be positive".into()));
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be positive".into()));
        }
        if self.ingest.queue_size == 0 {
            return Err(ConfigError::Invalid("ingest.queue_size must be positive".into()));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Merge another config into this one (other values take precedence if set)
    pub fn merge(&mut self, other: Config) {
        let join = JoinSection::default();
        if other.join.session_idle_timeout_secs != join.session_idle_timeout_secs {
            self.join.session_idle_timeout_secs = other.join.session_idle_timeout_secs;
        }
        if other.join.max_query_click_delay_secs != join.max_query_click_delay_secs {
            self.join.max_query_click_delay_secs = other.join.max_query_click_delay_secs;
        }
        if other.join.dry_run {
            self.join.dry_run = true;
        }
        if other.join.enable_cache {
            self.join.enable_cache = true;
        }
        if other.join.default_tenant != join.default_tenant {
            self.join.default_tenant = other.join.default_tenant;
        }

        let sweep = SweepSection::default();
        if other.sweep.enabled != sweep.enabled {
            self.sweep.enabled = other.sweep.enabled;
        }
        if other.sweep.interval_secs != sweep.interval_secs {
            self.sweep.interval_secs = other.sweep.interval_secs;
        }
        if other.sweep.advance_to_wall_clock {
            self.sweep.advance_to_wall_clock = true;
        }

        let ingest = IngestSection::default();
        if other.ingest.workers != ingest.workers {
            self.ingest.workers = other.ingest.workers;
        }
        if other.ingest.queue_size != ingest.queue_size {
            self.ingest.queue_size = other.ingest.queue_size;
        }
        if other.ingest.backpressure != ingest.backpressure {
            self.ingest.backpressure = other.ingest.backpressure;
        }

        if other.output.path.is_some() {
            self.output.path = other.output.path;
        }
        if other.output.pretty {
            self.output.pretty = true;
        }
        if other.output.dead_letter_path.is_some() {
            self.output.dead_letter_path = other.output.dead_letter_path;
        }

        if other.feature_cache != FeatureCacheSection::default() {
            self.feature_cache = other.feature_cache;
        }
        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }

        if other.metrics.enabled {
            self.metrics.enabled = true;
        }
        if other.metrics.stats_path.is_some() {
            self.metrics.stats_path = other.metrics.stats_path;
        }
    }

    pub fn join_config(&self) -> JoinConfig {
        JoinConfig {
            policy: FlushPolicy::new(
                chrono::Duration::seconds(self.join.session_idle_timeout_secs as i64),
                chrono::Duration::seconds(self.join.max_query_click_delay_secs as i64),
            ),
            dry_run: self.join.dry_run,
            enable_cache: self.join.enable_cache,
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: std::time::Duration::from_secs(self.sweep.interval_secs),
            advance_to_wall_clock: self.sweep.advance_to_wall_clock,
        }
    }

    pub fn ingest_config(&self) -> IngestPoolConfig {
        IngestPoolConfig {
            name: "ingest".to_string(),
            workers: self.ingest.workers,
            queue_size: self.ingest.queue_size,
            backpressure: self.ingest.backpressure,
        }
    }

    /// Create an example configuration
    pub fn example() -> Self {
        Self {
            join: JoinSection {
                default_tenant: "shop".to_string(),
                ..Default::default()
            },
            sweep: SweepSection::default(),
            ingest: IngestSection {
                workers: 8,
                queue_size: 10_000,
                backpressure: BackpressureStrategy::Block,
            },
            output: OutputSection {
                path: Some(PathBuf::from("/var/log/logjoin/joined.jsonl")),
                pretty: false,
                dead_letter_path: Some(PathBuf::from("/var/log/logjoin/rejected.jsonl")),
            },
            feature_cache: FeatureCacheSection {
                path: Some(PathBuf::from("/etc/logjoin/features.jsonl")),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
            metrics: MetricsSection {
                enabled: true,
                stats_path: Some(PathBuf::from("/var/lib/logjoin/stats.prom")),
            },
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.join.session_idle_timeout_secs, 1800);
        assert_eq!(config.join.max_query_click_delay_secs, 900);
        assert_eq!(config.sweep.interval_secs, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
join:
  session_idle_timeout_secs: 600
  dry_run: true
ingest:
  workers: 2
  backpressure: drop_newest
output:
  path: /tmp/out.jsonl
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.join.session_idle_timeout_secs, 600);
        assert_eq!(config.join.max_query_click_delay_secs, 900);
        assert!(config.join.dry_run);
        assert_eq!(config.ingest.workers, 2);
        assert_eq!(config.ingest.backpressure, BackpressureStrategy::DropNewest);
        assert_eq!(config.output.path, Some(PathBuf::from("/tmp/out.jsonl")));
    }

    #[test]
    fn test_toml_parsing() {
        let toml = r#"
[join]
max_query_click_delay_secs = 60
enable_cache = true

[sweep]
enabled = false
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.join.max_query_click_delay_secs, 60);
        assert!(config.join.enable_cache);
        assert!(!config.sweep.enabled);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        let override_config = Config {
            join: JoinSection {
                session_idle_timeout_secs: 3600,
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(override_config);
        assert_eq!(base.join.session_idle_timeout_secs, 3600);
        assert_eq!(base.join.max_query_click_delay_secs, 900);
    }

    #[test]
    fn test_join_config_conversion() {
        let mut config = Config::default();
        config.join.session_idle_timeout_secs = 120;
        config.join.max_query_click_delay_secs = 30;
        let join = config.join_config();
        assert_eq!(join.policy.session_idle_timeout, chrono::Duration::seconds(120));
        assert_eq!(join.policy.max_query_click_delay, chrono::Duration::seconds(30));
    }
}
