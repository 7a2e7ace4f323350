//! Configuration for the three core components.
//!
//! Configuration lives in an `arbor.toml` file (or is built in code); every
//! field has a default so a missing file or a partial file works. Durations
//! accept humantime strings (`"30s"`, `"2h"`) or integer milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use arbor_types::{deserialize_duration, serialize_duration};

/// Cypress tree knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CypressConfig {
    /// Link chains longer than this are treated as cyclic.
    #[serde(default = "default_max_link_depth")]
    pub max_link_depth: u32,
    /// Bound on `get`/`list` result sizes.
    #[serde(default = "default_max_read_size")]
    pub max_read_size: usize,
    /// Medium assumed when none is set anywhere along the ancestry.
    #[serde(default = "default_medium")]
    pub default_medium: String,
}

fn default_max_link_depth() -> u32 {
    32
}

fn default_max_read_size() -> usize {
    100_000
}

fn default_medium() -> String {
    "default".to_string()
}

impl Default for CypressConfig {
    fn default() -> Self {
        CypressConfig {
            max_link_depth: default_max_link_depth(),
            max_read_size: default_max_read_size(),
            default_medium: default_medium(),
        }
    }
}

/// Transaction manager knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionManagerConfig {
    #[serde(default = "default_max_transaction_depth")]
    pub max_transaction_depth: u32,
    /// Requested timeouts clamp to this.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_transaction_timeout"
    )]
    pub max_transaction_timeout: Duration,
    /// When false, empty `replicate_to` lists broadcast to every registered
    /// cell. The explicit-only mode is the default; the broadcast fallback
    /// is gone.
    #[serde(default = "default_true")]
    pub enable_lazy_replication: bool,
    /// How long finished foreign ids stay in the presence cache.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_finished_ttl"
    )]
    pub recently_finished_ttl: Duration,
    /// Boomerang waves older than this are collected by the sweep.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_stuck_wave_age"
    )]
    pub stuck_boomerang_wave_age: Duration,
}

fn default_max_transaction_depth() -> u32 {
    32
}

fn default_max_transaction_timeout() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_true() -> bool {
    true
}

fn default_finished_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_stuck_wave_age() -> Duration {
    Duration::from_secs(600)
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        TransactionManagerConfig {
            max_transaction_depth: default_max_transaction_depth(),
            max_transaction_timeout: default_max_transaction_timeout(),
            enable_lazy_replication: default_true(),
            recently_finished_ttl: default_finished_ttl(),
            stuck_boomerang_wave_age: default_stuck_wave_age(),
        }
    }
}

/// Operations cleaner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub enable_operation_archivation: bool,
    #[serde(default = "default_true")]
    pub enable_operation_alert_event_archivation: bool,
    /// Grace period after finish before an operation may be cleaned.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_clean_delay"
    )]
    pub clean_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_analysis_period"
    )]
    pub analysis_period: Duration,
    #[serde(default = "default_archive_batch_size")]
    pub archive_batch_size: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_batch_timeout"
    )]
    pub archive_batch_timeout: Duration,
    #[serde(default = "default_remove_batch_size")]
    pub remove_batch_size: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_batch_timeout"
    )]
    pub remove_batch_timeout: Duration,
    #[serde(default = "default_remove_subbatch_size")]
    pub remove_subbatch_size: usize,
    /// Retention: never hold more than this many finished operations.
    #[serde(default = "default_hard_retained")]
    pub hard_retained_operation_count: usize,
    /// Retention: above this, only failed operations are kept.
    #[serde(default = "default_soft_retained")]
    pub soft_retained_operation_count: usize,
    #[serde(default = "default_per_user")]
    pub max_operation_count_per_user: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_age"
    )]
    pub max_operation_age: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_min_retry_sleep"
    )]
    pub min_archivation_retry_sleep_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_retry_sleep"
    )]
    pub max_archivation_retry_sleep_delay: Duration,
    /// Pending archivations at or above this raise the archivation alert.
    #[serde(default = "default_alert_watermark")]
    pub min_operation_count_enqueued_for_alert: usize,
    /// Pending archivations above this temporarily disable archivation.
    #[serde(default = "default_disable_watermark")]
    pub max_operation_count_enqueued_for_archival: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_enable_delay"
    )]
    pub archivation_enable_delay: Duration,
    /// Serialized row values heavier than this skip the operation.
    #[serde(default = "default_max_value_weight")]
    pub max_archive_value_weight: usize,
    #[serde(default = "default_archive_version")]
    pub archive_version: i32,
    #[serde(default = "default_max_alert_events_per_operation")]
    pub max_alert_event_count_per_operation: usize,
    #[serde(default = "default_max_enqueued_alert_events")]
    pub max_enqueued_operation_alert_event_count: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_alert_send_period"
    )]
    pub operation_alert_event_send_period: Duration,
    /// Alert-sender silence longer than this raises its own alert.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_alert_sender_threshold"
    )]
    pub operation_alert_sender_alert_threshold: Duration,
}

fn default_clean_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_analysis_period() -> Duration {
    Duration::from_secs(30)
}

fn default_archive_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_remove_batch_size() -> usize {
    256
}

fn default_remove_subbatch_size() -> usize {
    64
}

fn default_hard_retained() -> usize {
    4000
}

fn default_soft_retained() -> usize {
    2000
}

fn default_per_user() -> usize {
    500
}

fn default_max_age() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_min_retry_sleep() -> Duration {
    Duration::from_millis(100)
}

fn default_max_retry_sleep() -> Duration {
    Duration::from_secs(2)
}

fn default_alert_watermark() -> usize {
    500
}

fn default_disable_watermark() -> usize {
    5000
}

fn default_enable_delay() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_value_weight() -> usize {
    16 * 1024 * 1024
}

fn default_archive_version() -> i32 {
    43
}

fn default_max_alert_events_per_operation() -> usize {
    100
}

fn default_max_enqueued_alert_events() -> usize {
    1000
}

fn default_alert_send_period() -> Duration {
    Duration::from_secs(60)
}

fn default_alert_sender_threshold() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for CleanerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty cleaner config must deserialize")
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub cypress: CypressConfig,
    #[serde(default)]
    pub transaction_manager: TransactionManagerConfig,
    #[serde(default)]
    pub operations_cleaner: CleanerConfig,
}

/// Default configuration file name.
pub const CONFIG_FILE: &str = "arbor.toml";

/// Loads configuration from a TOML file; a missing file yields defaults.
pub fn load_config(path: &Path) -> Result<ArborConfig> {
    if !path.exists() {
        return Ok(ArborConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ArborConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ArborConfig::default();
        assert!(config.transaction_manager.max_transaction_depth > 0);
        assert!(
            config.operations_cleaner.soft_retained_operation_count
                <= config.operations_cleaner.hard_retained_operation_count
        );
        assert!(
            config.operations_cleaner.min_archivation_retry_sleep_delay
                <= config.operations_cleaner.max_archivation_retry_sleep_delay
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ArborConfig = toml::from_str(
            r#"
            [transaction_manager]
            max_transaction_depth = 4
            max_transaction_timeout = "30s"

            [operations_cleaner]
            archive_batch_size = 7
            clean_delay = "1s"
            "#,
        )
        .unwrap();
        assert_eq!(config.transaction_manager.max_transaction_depth, 4);
        assert_eq!(
            config.transaction_manager.max_transaction_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(config.operations_cleaner.archive_batch_size, 7);
        assert_eq!(config.operations_cleaner.clean_delay, Duration::from_secs(1));
        // Untouched sections default.
        assert_eq!(config.cypress.max_link_depth, 32);
    }

    #[test]
    fn test_duration_accepts_milliseconds() {
        let config: ArborConfig = toml::from_str(
            r#"
            [operations_cleaner]
            archive_batch_timeout = 1500
            "#,
        )
        .unwrap();
        assert_eq!(
            config.operations_cleaner.archive_batch_timeout,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.operations_cleaner.enable);
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = ArborConfig::default();
        config.cypress.max_link_depth = 5;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.cypress.max_link_depth, 5);
    }
}
