//! Multi-strategy backtests.
//!
//! Strategies trading the same symbol and interval share one replayed
//! stream: a [`Broadcaster`] feeds one pipeline per distinct strategy and
//! each pipeline writes its own report.

use crate::config::StrategySettings;
use crate::error::{PipelineError, Result};
use crate::services::broadcaster::Broadcaster;
use crate::services::pipeline::{BacktestRecorder, Pipeline, RunSummary, SeriesDumpObserver};
use crate::services::sources::SampleSource;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A strategy and the name its report is filed under.
#[derive(Debug, Clone)]
pub struct NamedStrategy {
    pub name: String,
    pub settings: StrategySettings,
}

impl NamedStrategy {
    pub fn new(name: impl Into<String>, settings: StrategySettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }
}

/// Strategies fed from one `symbol|interval` stream.
#[derive(Debug, Clone)]
pub struct StrategyGroup {
    pub symbol: String,
    pub interval: String,
    pub strategies: Vec<NamedStrategy>,
}

impl StrategyGroup {
    pub fn key(&self) -> String {
        format!("{}|{}", self.symbol, self.interval)
    }

    /// Report file for one member. Names are only added when the group has
    /// several members.
    pub fn report_file_name(&self, strategy: &NamedStrategy, at: DateTime<Utc>) -> String {
        if self.strategies.len() == 1 {
            return BacktestRecorder::file_name(&strategy.settings, at);
        }
        format!(
            "{}_{}_{}_{}.json",
            self.symbol,
            self.interval,
            strategy.name,
            at.format("%Y%m%dT%H%M%SZ")
        )
    }
}

/// Where a group run writes and how it buffers.
#[derive(Debug, Clone)]
pub struct GroupRunOptions {
    pub report_dir: PathBuf,
    /// Final series per strategy are dumped here when set.
    pub series_dir: Option<PathBuf>,
    /// Stamped into output file names.
    pub started: DateTime<Utc>,
    pub capacity: usize,
}

/// Outcome of one strategy in a group run.
#[derive(Debug)]
pub struct StrategyRun {
    pub name: String,
    pub report_path: PathBuf,
    pub series_path: Option<PathBuf>,
    pub summary: RunSummary,
}

/// Load strategy files. Directories contribute their `*.json` files in
/// name order. Names come from file stems and are made unique.
pub fn load_strategies(paths: &[PathBuf]) -> Result<Vec<NamedStrategy>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "json"))
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }

    let mut names = HashSet::new();
    let mut strategies = Vec::with_capacity(files.len());
    for file in files {
        let settings = StrategySettings::load(&file)?;
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "strategy".to_string());

        let mut name = stem.clone();
        let mut n = 2;
        while !names.insert(name.clone()) {
            name = format!("{}_{}", stem, n);
            n += 1;
        }
        info!("Loaded strategy {} from {}", name, file.display());
        strategies.push(NamedStrategy::new(name, settings));
    }
    Ok(strategies)
}

/// Group strategies by `(symbol, interval)`, in key order. Strategies with
/// identical settings run once; later copies are skipped.
pub fn group_by_stream(strategies: Vec<NamedStrategy>) -> Vec<StrategyGroup> {
    let mut groups: BTreeMap<(String, String), StrategyGroup> = BTreeMap::new();
    let mut seen: Vec<serde_json::Value> = Vec::new();

    for strategy in strategies {
        if let Ok(value) = serde_json::to_value(&strategy.settings) {
            if seen.contains(&value) {
                warn!("Skipping strategy {}: same settings as an earlier one", strategy.name);
                continue;
            }
            seen.push(value);
        }

        let symbol = strategy.settings.symbol.clone();
        let interval = strategy.settings.interval.clone();
        groups
            .entry((symbol.clone(), interval.clone()))
            .or_insert_with(|| StrategyGroup {
                symbol,
                interval,
                strategies: Vec::new(),
            })
            .strategies
            .push(strategy);
    }

    groups.into_values().collect()
}

/// Replay `source` once through every strategy of `group`.
///
/// The source is closed afterwards.
pub async fn run_group(
    group: &StrategyGroup,
    source: &mut dyn SampleSource,
    options: &GroupRunOptions,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<StrategyRun>> {
    let broadcaster = Broadcaster::new(source.receiver()?, options.capacity);

    let mut tasks = Vec::with_capacity(group.strategies.len());
    for strategy in &group.strategies {
        let file_name = group.report_file_name(strategy, options.started);
        let report_path = options.report_dir.join(&file_name);
        let recorder = BacktestRecorder::new(&report_path).with_strategy(strategy.settings.clone());
        let mut pipeline = Pipeline::from_settings(&strategy.settings)?.with_observer(Box::new(recorder));

        let series_path = options.series_dir.as_ref().map(|dir| dir.join(&file_name));
        if let Some(path) = &series_path {
            pipeline.add_observer(Box::new(SeriesDumpObserver::new(path)));
        }

        let samples = broadcaster.subscribe()?;
        let shutdown_rx = shutdown.subscribe();
        let task = tokio::spawn(async move { pipeline.run(samples, shutdown_rx).await });
        tasks.push((strategy.name.clone(), report_path, series_path, task));
    }

    info!("Running {} strategies on {}", tasks.len(), group.key());
    broadcaster.start()?;

    let mut runs = Vec::with_capacity(tasks.len());
    for (name, report_path, series_path, task) in tasks {
        let summary = task.await.map_err(|e| PipelineError::Task(e.to_string()))?;
        runs.push(StrategyRun {
            name,
            report_path,
            series_path,
            summary,
        });
    }

    let forwarded = broadcaster.wait().await?;
    info!("{}: broadcaster forwarded {} samples", group.key(), forwarded);
    source.close();

    Ok(runs)
}
