use crate::error::{PipelineError, Result};
use crate::services::clusters::{VolumeAccounting, DEFAULT_MAX_ITERATIONS};
use crate::services::dispatcher::DispatcherSettings;
use crate::services::series::SeriesBuilderConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};

/// Keys shared by every flat pipeline config.
const PIPELINE_KEYS: &[&str] = &[
    "type",
    "block_size",
    "num_clusters",
    "min_volume_change_percent",
    "max_iterations",
    "volume_accounting",
    "seed",
    "timeframe",
];

/// Runtime configuration for the binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON array of samples replayed in backtest mode.
    pub samples_file: PathBuf,
    /// Strategy files or directories of `*.json` strategies.
    pub strategy_paths: Vec<PathBuf>,
    /// Where reports and series dumps are written.
    pub output_dir: PathBuf,
    /// Capacity of source and subscriber channels.
    pub channel_capacity: usize,
    /// Also write each strategy's final series under `output_dir/series`.
    pub dump_series: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            samples_file: env::var("SAMPLES_FILE")
                .unwrap_or_else(|_| "samples.json".to_string())
                .into(),
            strategy_paths: env::var("STRATEGY_FILES")
                .or_else(|_| env::var("STRATEGY_FILE"))
                .map(|v| split_paths(&v))
                .ok()
                .filter(|paths| !paths.is_empty())
                .unwrap_or_else(|| vec![PathBuf::from("strategy.json")]),
            output_dir: env::var("OUTPUT_DIR")
                .unwrap_or_else(|_| "output".to_string())
                .into(),
            channel_capacity: env::var("CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(1024),
            dump_series: env::var("DUMP_SERIES")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

/// Comma-separated path list, blanks skipped.
fn split_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

// ---------------------------------------------------------------------------
// Strict key/value lookups
// ---------------------------------------------------------------------------

pub(crate) fn check_keys(map: &Map<String, Value>, allowed: &[&str]) -> Result<()> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(PipelineError::UnknownKey(key.clone())),
        None => Ok(()),
    }
}

fn require<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    map.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| PipelineError::MissingKey(key.to_string()))
}

pub(crate) fn require_str(map: &Map<String, Value>, key: &str) -> Result<String> {
    require(map, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PipelineError::invalid(key, "expected a string"))
}

pub(crate) fn optional_str(map: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => require_str(map, key).map(Some),
    }
}

pub(crate) fn require_f64(map: &Map<String, Value>, key: &str) -> Result<f64> {
    require(map, key)?
        .as_f64()
        .ok_or_else(|| PipelineError::invalid(key, "expected a number"))
}

pub(crate) fn require_u64(map: &Map<String, Value>, key: &str) -> Result<u64> {
    require(map, key)?
        .as_u64()
        .ok_or_else(|| PipelineError::invalid(key, "expected a non-negative integer"))
}

pub(crate) fn optional_u64(map: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => require_u64(map, key).map(Some),
    }
}

pub(crate) fn require_usize(map: &Map<String, Value>, key: &str) -> Result<usize> {
    let v = require_u64(map, key)?;
    usize::try_from(v).map_err(|_| PipelineError::invalid(key, "out of range"))
}

pub(crate) fn optional_usize(map: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => require_usize(map, key).map(Some),
    }
}

// ---------------------------------------------------------------------------
// Pipeline configuration
// ---------------------------------------------------------------------------

/// Everything one pipeline instance needs, parsed from a flat key/value map.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub block_size: usize,
    pub num_clusters: usize,
    pub max_iterations: usize,
    pub volume_accounting: VolumeAccounting,
    /// Fixed RNG seed; entropy when absent.
    pub seed: Option<u64>,
    /// Timeframe stamped on clustered samples; inherited from input when absent.
    pub timeframe: Option<String>,
    pub series_builder: SeriesBuilderConfig,
    pub min_volume_change_percent: f64,
}

impl PipelineConfig {
    /// Parse a flat map. Missing required keys, wrong value types, values
    /// out of range and keys that belong to no component are all rejected.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let kind = require_str(map, "type")?;
        let coefficients: &[&str] = match kind.as_str() {
            "simple" => &["value_factor", "time_factor"],
            "windowed" => &["max_time_gap", "max_value_diff"],
            other => {
                return Err(PipelineError::UnknownType {
                    kind: "series builder",
                    name: other.to_string(),
                })
            }
        };
        let allowed: Vec<&str> = PIPELINE_KEYS.iter().chain(coefficients).copied().collect();
        check_keys(map, &allowed)?;

        let volume_accounting = match optional_str(map, "volume_accounting")? {
            None => VolumeAccounting::default(),
            Some(s) => VolumeAccounting::from_str(&s)
                .ok_or_else(|| PipelineError::invalid("volume_accounting", "expected `legacy` or `member`"))?,
        };

        let config = Self {
            block_size: require_usize(map, "block_size")?,
            num_clusters: require_usize(map, "num_clusters")?,
            max_iterations: optional_usize(map, "max_iterations")?.unwrap_or(DEFAULT_MAX_ITERATIONS),
            volume_accounting,
            seed: optional_u64(map, "seed")?,
            timeframe: optional_str(map, "timeframe")?,
            series_builder: SeriesBuilderConfig::from_shared_map(map)?,
            min_volume_change_percent: require_f64(map, "min_volume_change_percent")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(PipelineError::invalid("block_size", "must be >= 1"));
        }
        if self.num_clusters == 0 {
            return Err(PipelineError::invalid("num_clusters", "must be >= 1"));
        }
        if self.max_iterations == 0 {
            return Err(PipelineError::invalid("max_iterations", "must be >= 1"));
        }
        if !self.min_volume_change_percent.is_finite() || self.min_volume_change_percent < 0.0 {
            return Err(PipelineError::invalid(
                "min_volume_change_percent",
                "must be a finite number >= 0",
            ));
        }
        self.series_builder.validate()
    }
}

// ---------------------------------------------------------------------------
// Strategy file
// ---------------------------------------------------------------------------

/// Clustering section of a strategy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSettings {
    pub block_size: usize,
    pub num_clusters: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub volume_accounting: VolumeAccounting,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

/// A complete strategy: what to trade and how the pipeline is wired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategySettings {
    pub symbol: String,
    /// Candle timeframe, stamped on clustered samples.
    pub interval: String,
    pub cluster: ClusterSettings,
    /// `{type, ...coefficients}` as accepted by [`SeriesBuilderConfig::from_map`].
    pub series_builder: Map<String, Value>,
    pub dispatcher: DispatcherSettings,
}

impl StrategySettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn series_builder_config(&self) -> Result<SeriesBuilderConfig> {
        SeriesBuilderConfig::from_map(&self.series_builder)
    }

    /// Check every section without building anything that has side effects.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.block_size == 0 {
            return Err(PipelineError::invalid("cluster.block_size", "must be >= 1"));
        }
        if self.cluster.num_clusters == 0 {
            return Err(PipelineError::invalid("cluster.num_clusters", "must be >= 1"));
        }
        if self.cluster.max_iterations == 0 {
            return Err(PipelineError::invalid("cluster.max_iterations", "must be >= 1"));
        }
        self.series_builder_config()?;
        Ok(())
    }
}
