//! Configuration management

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub layers: LayersConfig,
    #[serde(default)]
    pub predictions: PredictionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend holding the durable documents
    pub backend: StorageBackend,
    /// Data directory (fs) or database file (sqlite)
    pub path: String,
    /// Capacity of each durable topic collection
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
    /// Dedup ledger threshold of each durable topic collection
    #[serde(default = "default_topic_dedup")]
    pub topic_dedup_threshold: usize,
}

fn default_topic_capacity() -> usize {
    500
}

fn default_topic_dedup() -> usize {
    5000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    List,
    Snapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    /// Section name in the aggregate document
    pub name: String,
    pub kind: SectionKind,
    /// Durable topic backing a list section
    pub topic: Option<String>,
    /// BoundedList capacity for list sections
    #[serde(default = "default_section_capacity")]
    pub capacity: usize,
    /// DedupLedger threshold for list sections
    #[serde(default = "default_section_dedup")]
    pub dedup_threshold: usize,
    /// Seconds between producer ticks
    pub cadence_secs: u64,
    /// Upper bound on one compute, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_section_capacity() -> usize {
    200
}

fn default_section_dedup() -> usize {
    2000
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    /// Delay before the first producer starts, in seconds
    pub startup_delay_secs: u64,
    /// Added per producer to stagger the first ticks, in seconds
    pub stagger_step_secs: u64,
    /// Upper bound of random jitter added to each initial delay, in milliseconds
    pub stagger_jitter_ms: u64,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Local time of the daily run, "HH:MM"
    pub run_at: String,
    /// Move (in percent) that records an event
    pub event_threshold_pct: Decimal,
    /// Metric key prefixes watched for events
    pub tracked_prefixes: Vec<String>,
    /// Days a daily entry waits for its week before a partial rollup
    pub daily_retention_days: i64,
    /// Weeks a weekly entry waits for its month
    pub weekly_retention_weeks: i64,
    /// Months a monthly entry waits for its quarter
    pub monthly_retention_months: i64,
    /// Years a quarterly entry waits for its year
    pub quarterly_retention_years: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayersConfig {
    /// Maximum history entries per layer
    pub history_limit: usize,
    /// Keys ignored when deciding whether a layer value changed
    pub volatile_fields: Vec<String>,
    /// Capacity of the per-entity report list
    pub report_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionConfig {
    /// Seconds between evaluation passes
    pub evaluate_interval_secs: u64,
    /// Absolute change (percent) below which a move counts as flat
    pub flat_band_pct: Decimal,
    /// Weight of direction correctness in the score (0-1)
    pub direction_weight: Decimal,
    /// Score points lost per percent of price error
    pub error_penalty_per_pct: Decimal,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("config path is not valid UTF-8"))?;

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MARKETFEED").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Load from default locations
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = ["marketfeed.toml", "marketfeed.yaml", "~/.config/marketfeed/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        anyhow::bail!("No configuration file found")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            path: "~/.local/share/marketfeed".to_string(),
            topic_capacity: default_topic_capacity(),
            topic_dedup_threshold: default_topic_dedup(),
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: 2,
            stagger_step_secs: 3,
            stagger_jitter_ms: 500,
            sections: Vec::new(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            run_at: "23:50".to_string(),
            event_threshold_pct: Decimal::new(2, 0), // 2%
            tracked_prefixes: vec!["macro:".to_string()],
            daily_retention_days: 7,
            weekly_retention_weeks: 4,
            monthly_retention_months: 12,
            quarterly_retention_years: 3,
        }
    }
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            volatile_fields: vec![
                "generatedAt".to_string(),
                "updatedAt".to_string(),
                "lastCheckedAt".to_string(),
                "fetchedAt".to_string(),
            ],
            report_capacity: 50,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            evaluate_interval_secs: 900,
            flat_band_pct: Decimal::new(5, 1),        // 0.5%
            direction_weight: Decimal::new(6, 1),     // 60%
            error_penalty_per_pct: Decimal::new(10, 0), // 10 points per 1% error
        }
    }
}
