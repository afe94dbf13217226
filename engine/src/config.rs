// engine/src/config.rs
//
// Configuration for the learned index.
//
// Priority order (highest to lowest):
// 1. Environment variables (RMIDB__* prefix)
// 2. Config file (YAML/TOML/JSON)
// 3. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::trainer::{PartitionKind, PartitionStrategy};

// ============================================================================
// Main Configuration Structure
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearnedIndexConfig {
    /// Segmentation strategy used by rebuilds
    pub partition: PartitionKind,

    /// Maximum per-segment error for greedy partitioning
    pub epsilon: u64,

    /// Number of segments for fixed partitioning
    pub segment_count: usize,

    /// Segments whose fitted bound exceeds this are logged and counted.
    /// Never used to cap a bound.
    pub warn_error_bound: u64,

    /// Exhaustively check every bound after each rebuild before publishing
    pub verify_after_rebuild: bool,

    /// Observed-error monitoring that schedules full rebuilds
    pub adaptive: AdaptiveConfig,

    /// Background refresh task
    pub maintenance: MaintenanceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for LearnedIndexConfig {
    fn default() -> Self {
        Self {
            partition: PartitionKind::Greedy,
            epsilon: 32,
            segment_count: 16,
            warn_error_bound: 256,
            verify_after_rebuild: false,
            adaptive: AdaptiveConfig::default(),
            maintenance: MaintenanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ============================================================================
// Adaptive Monitoring
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConfig {
    pub enabled: bool,

    /// Rebuild once a segment's observed error exceeds
    /// `error_margin * recorded bound`
    pub error_margin: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            error_margin: 1.0,
        }
    }
}

// ============================================================================
// Background Maintenance
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Interval between background `ensure_fresh` calls (0 = disabled)
    pub refresh_interval_ms: u64,
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: LogLevel,

    /// Log format (json or text)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format (for log aggregation)
    Json,
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl LearnedIndexConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (RMIDB__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults = Self::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RMIDB")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.epsilon >= 1,
            "epsilon must be >= 1, got {}",
            self.epsilon
        );
        anyhow::ensure!(
            self.segment_count >= 1,
            "segment_count must be >= 1, got {}",
            self.segment_count
        );
        anyhow::ensure!(
            self.adaptive.error_margin.is_finite() && self.adaptive.error_margin >= 1.0,
            "adaptive.error_margin must be a finite value >= 1.0, got {}",
            self.adaptive.error_margin
        );
        Ok(())
    }

    pub fn partition_strategy(&self) -> PartitionStrategy {
        match self.partition {
            PartitionKind::Greedy => PartitionStrategy::Greedy {
                epsilon: self.epsilon,
            },
            PartitionKind::Fixed => PartitionStrategy::Fixed {
                segment_count: self.segment_count,
            },
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.maintenance.refresh_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = LearnedIndexConfig::default();
        config.validate().expect("Default config should be valid");
        assert_eq!(
            config.partition_strategy(),
            PartitionStrategy::Greedy { epsilon: 32 }
        );
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn test_zero_epsilon_rejected() {
        let mut config = LearnedIndexConfig::default();
        config.epsilon = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_segment_count_rejected() {
        let mut config = LearnedIndexConfig::default();
        config.segment_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_error_margin_below_one_rejected() {
        let mut config = LearnedIndexConfig::default();
        config.adaptive.error_margin = 0.5;
        assert!(config.validate().is_err());
        config.adaptive.error_margin = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fixed_strategy_mapping() {
        let mut config = LearnedIndexConfig::default();
        config.partition = PartitionKind::Fixed;
        config.segment_count = 8;
        assert_eq!(
            config.partition_strategy(),
            PartitionStrategy::Fixed { segment_count: 8 }
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rmidb.toml");
        std::fs::write(
            &path,
            "partition = \"fixed\"\nsegment_count = 4\n\n[maintenance]\nrefresh_interval_ms = 250\n",
        )
        .unwrap();

        let config = LearnedIndexConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.partition, PartitionKind::Fixed);
        assert_eq!(config.segment_count, 4);
        assert_eq!(config.epsilon, 32);
        assert_eq!(config.refresh_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Trace.as_str(), "trace");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }
}
