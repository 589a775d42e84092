//! The per-strategy processing loop.
//!
//! Samples are aggregated into blocks; each full block is clustered, the
//! resulting points extend the series, and every series touched by the block
//! is dispatched. One pass over a block is a tick.

use crate::config::{PipelineConfig, StrategySettings};
use crate::error::Result;
use crate::services::aggregator::BlockAggregator;
use crate::services::clusters::Clusterer;
use crate::services::dispatcher::{Dispatcher, VolumeTrendRule};
use crate::services::series::{SeriesBuilder, SeriesMetrics};
use crate::services::sources::SampleSource;
use crate::types::{Point, Sample, Series, SignalType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Outcome of dispatching one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub series_id: usize,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
}

/// Owned summary of one tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub index: u64,
    /// Timestamp of the block's first sample.
    pub time: DateTime<Utc>,
    pub points: usize,
    pub new_series: usize,
    pub dispatched: Vec<DispatchRecord>,
}

/// Borrowed view of a tick handed to observers.
pub struct Tick<'a> {
    pub report: &'a TickReport,
    pub block: &'a [Sample],
    pub points: &'a [Point],
    pub series: &'a [Series],
}

/// Notified after every tick and once at the end of a run.
pub trait TickObserver: Send {
    fn on_tick(&mut self, tick: &Tick<'_>);

    fn on_finish(&mut self, _series: &[Series]) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalCounts {
    pub buy: u64,
    pub sell: u64,
    pub hold: u64,
}

impl SignalCounts {
    fn record(&mut self, signal_type: SignalType) {
        match signal_type {
            SignalType::Buy => self.buy += 1,
            SignalType::Sell => self.sell += 1,
            SignalType::Hold => self.hold += 1,
        }
    }
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub samples: u64,
    pub ticks: u64,
    /// Samples left in an incomplete block when the run ended.
    pub discarded: usize,
    pub cancelled: bool,
    pub signals: SignalCounts,
    pub metrics: SeriesMetrics,
}

pub struct Pipeline {
    aggregator: BlockAggregator,
    clusterer: Clusterer,
    builder: SeriesBuilder,
    dispatcher: Arc<RwLock<Dispatcher>>,
    observers: Vec<Box<dyn TickObserver>>,
    samples: u64,
    ticks: u64,
    signals: SignalCounts,
}

impl Pipeline {
    pub fn new(
        aggregator: BlockAggregator,
        clusterer: Clusterer,
        builder: SeriesBuilder,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            aggregator,
            clusterer,
            builder,
            dispatcher: Arc::new(RwLock::new(dispatcher)),
            observers: Vec::new(),
            samples: 0,
            ticks: 0,
            signals: SignalCounts::default(),
        }
    }

    /// Build from a flat config. The dispatcher gets a single volume trend
    /// rule and no handlers; register handlers via [`Pipeline::dispatcher`].
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let aggregator = BlockAggregator::new(config.block_size)?;

        let mut clusterer = Clusterer::new(config.num_clusters, config.max_iterations)?
            .with_accounting(config.volume_accounting);
        if let Some(seed) = config.seed {
            clusterer = clusterer.with_seed(seed);
        }
        if let Some(timeframe) = &config.timeframe {
            clusterer = clusterer.with_timeframe(timeframe);
        }

        let builder = SeriesBuilder::from_config(&config.series_builder)?;
        let rule = VolumeTrendRule::new(config.min_volume_change_percent)?;
        let dispatcher = Dispatcher::with_rules(vec![Box::new(rule)]);

        Ok(Self::new(aggregator, clusterer, builder, dispatcher))
    }

    /// Build every component a strategy file describes.
    pub fn from_settings(settings: &StrategySettings) -> Result<Self> {
        settings.validate()?;
        let cluster = &settings.cluster;
        let aggregator = BlockAggregator::new(cluster.block_size)?;

        let mut clusterer = Clusterer::new(cluster.num_clusters, cluster.max_iterations)?
            .with_accounting(cluster.volume_accounting)
            .with_timeframe(&settings.interval);
        if let Some(seed) = cluster.seed {
            clusterer = clusterer.with_seed(seed);
        }

        let builder = SeriesBuilder::from_map(&settings.series_builder)?;
        let dispatcher = Dispatcher::from_settings(&settings.dispatcher)?;

        info!(
            "Pipeline for {} {}: block {}, {} clusters, {}",
            settings.symbol,
            settings.interval,
            cluster.block_size,
            cluster.num_clusters,
            builder.matcher_name()
        );
        Ok(Self::new(aggregator, clusterer, builder, dispatcher))
    }

    pub fn with_observer(mut self, observer: Box<dyn TickObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn TickObserver>) {
        self.observers.push(observer);
    }

    /// Shared handle to the dispatcher. Replacing its contents takes effect
    /// from the next tick.
    pub fn dispatcher(&self) -> Arc<RwLock<Dispatcher>> {
        self.dispatcher.clone()
    }

    pub fn builder(&self) -> &SeriesBuilder {
        &self.builder
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Feed one sample. Returns a report when it completed a block.
    pub fn process_sample(&mut self, sample: Sample) -> Option<TickReport> {
        self.samples += 1;
        self.aggregator.add(sample);
        let block = self.aggregator.drain_and_reset()?;

        let points = self.clusterer.cluster_block(&block);
        let time = block[0].timestamp;
        let index = self.ticks;
        self.ticks += 1;

        let new_series = self.builder.add_points(points.clone());

        let mut dispatched = Vec::new();
        if !points.is_empty() {
            let dispatcher = self
                .dispatcher
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for series in self.builder.active_series() {
                let signal_type = dispatcher.dispatch(series);
                self.signals.record(signal_type);
                dispatched.push(DispatchRecord {
                    series_id: series.id,
                    time,
                    signal_type,
                });
            }
        }

        let report = TickReport {
            index,
            time,
            points: points.len(),
            new_series,
            dispatched,
        };
        debug!(
            "Tick {} at {}: {} point(s), {} new series, {} dispatched",
            report.index,
            report.time,
            report.points,
            report.new_series,
            report.dispatched.len()
        );

        let tick = Tick {
            report: &report,
            block: &block,
            points: &points,
            series: self.builder.series(),
        };
        for observer in self.observers.iter_mut() {
            observer.on_tick(&tick);
        }

        Some(report)
    }

    /// Consume samples until the stream ends or `shutdown` fires.
    ///
    /// An incomplete trailing block is discarded in both cases.
    pub async fn run(
        &mut self,
        mut samples: mpsc::Receiver<Sample>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> RunSummary {
        let mut cancelled = false;
        let mut shutdown_open = true;

        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv(), if shutdown_open => match signal {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        info!("Pipeline received shutdown signal");
                        cancelled = true;
                        break;
                    }
                    // sender gone without a signal: keep consuming
                    Err(RecvError::Closed) => shutdown_open = false,
                },
                next = samples.recv() => match next {
                    Some(sample) => {
                        self.process_sample(sample);
                    }
                    None => break,
                },
            }
        }

        let discarded = self.aggregator.discard();
        if discarded > 0 {
            debug!("Discarded {} sample(s) of an incomplete block", discarded);
        }

        for observer in self.observers.iter_mut() {
            observer.on_finish(self.builder.series());
        }

        let metrics = self.builder.metrics();
        metrics.log();

        let summary = RunSummary {
            samples: self.samples,
            ticks: self.ticks,
            discarded,
            cancelled,
            signals: self.signals,
            metrics,
        };
        info!(
            "Pipeline finished: {} samples, {} ticks, {} buy / {} sell / {} hold{}",
            summary.samples,
            summary.ticks,
            summary.signals.buy,
            summary.signals.sell,
            summary.signals.hold,
            if cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    /// Run over a source's stream and close the source afterwards.
    pub async fn run_source(
        &mut self,
        source: &mut dyn SampleSource,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<RunSummary> {
        let samples = source.receiver()?;
        let summary = self.run(samples, shutdown).await;
        source.close();
        Ok(summary)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Writes the final series as JSON when the run ends.
pub struct SeriesDumpObserver {
    path: PathBuf,
}

impl SeriesDumpObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TickObserver for SeriesDumpObserver {
    fn on_tick(&mut self, _tick: &Tick<'_>) {}

    fn on_finish(&mut self, series: &[Series]) {
        match write_json(&self.path, series) {
            Ok(()) => info!("Wrote {} series to {}", series.len(), self.path.display()),
            Err(e) => warn!("Failed to write series to {}: {}", self.path.display(), e),
        }
    }
}

/// Everything a backtest produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategySettings>,
    pub market_data: Vec<Sample>,
    pub clustered_market_data: Vec<Sample>,
    pub signals: Vec<DispatchRecord>,
    pub series: Vec<Series>,
    pub metrics: SeriesMetrics,
}

/// Collects raw and clustered samples plus dispatch outcomes, and writes a
/// pretty JSON report when the run ends.
pub struct BacktestRecorder {
    path: PathBuf,
    report: BacktestReport,
}

impl BacktestRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            report: BacktestReport {
                generated_at: Utc::now(),
                strategy: None,
                market_data: Vec::new(),
                clustered_market_data: Vec::new(),
                signals: Vec::new(),
                series: Vec::new(),
                metrics: SeriesMetrics::default(),
            },
        }
    }

    pub fn with_strategy(mut self, settings: StrategySettings) -> Self {
        self.report.strategy = Some(settings);
        self
    }

    /// Report file name for a strategy, e.g. `BTCUSDT_1m_20240101T000000Z.json`.
    pub fn file_name(settings: &StrategySettings, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}.json",
            settings.symbol,
            settings.interval,
            at.format("%Y%m%dT%H%M%SZ")
        )
    }

    pub fn report(&self) -> &BacktestReport {
        &self.report
    }

    pub fn write(&self) -> Result<()> {
        write_json(&self.path, &self.report)
    }
}

impl TickObserver for BacktestRecorder {
    fn on_tick(&mut self, tick: &Tick<'_>) {
        self.report.market_data.extend_from_slice(tick.block);
        self.report
            .clustered_market_data
            .extend(tick.points.iter().map(|p| p.sample.as_ref().clone()));
        self.report
            .signals
            .extend(tick.report.dispatched.iter().cloned());
    }

    fn on_finish(&mut self, series: &[Series]) {
        self.report.series = series.to_vec();
        self.report.metrics = SeriesMetrics::collect(series);
        match self.write() {
            Ok(()) => info!("Saved backtest report to {}", self.path.display()),
            Err(e) => warn!("Failed to save backtest report to {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clusters::VolumeAccounting;
    use crate::services::series::SeriesBuilderConfig;
    use chrono::{Duration, TimeZone};

    fn config(block_size: usize, num_clusters: usize) -> PipelineConfig {
        PipelineConfig {
            block_size,
            num_clusters,
            max_iterations: 100,
            volume_accounting: VolumeAccounting::Legacy,
            seed: Some(1),
            timeframe: None,
            series_builder: SeriesBuilderConfig::Simple {
                value_factor: 1.0,
                time_factor: 0.001,
            },
            min_volume_change_percent: 10.0,
        }
    }

    fn sample(i: i64, price: f64, volume: f64) -> Sample {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i);
        Sample::new(t, "BTCUSDT", "1m", price, volume, volume * 0.6, volume * 0.4)
    }

    #[test]
    fn test_tick_only_on_full_block() {
        let mut pipeline = Pipeline::from_config(&config(3, 1)).unwrap();
        assert!(pipeline.process_sample(sample(0, 100.0, 1.0)).is_none());
        assert!(pipeline.process_sample(sample(1, 101.0, 1.0)).is_none());

        let report = pipeline.process_sample(sample(2, 102.0, 1.0)).unwrap();
        assert_eq!(report.index, 0);
        assert_eq!(report.points, 1);
        assert_eq!(report.new_series, 1);
        assert_eq!(report.time, sample(0, 0.0, 0.0).timestamp);
        assert_eq!(pipeline.ticks(), 1);

        assert!(pipeline.process_sample(sample(3, 103.0, 1.0)).is_none());
    }

    struct Counter(Arc<std::sync::Mutex<(usize, usize)>>);

    impl TickObserver for Counter {
        fn on_tick(&mut self, _tick: &Tick<'_>) {
            self.0.lock().unwrap().0 += 1;
        }

        fn on_finish(&mut self, _series: &[Series]) {
            self.0.lock().unwrap().1 += 1;
        }
    }

    #[tokio::test]
    async fn test_run_discards_partial_block() {
        let counts = Arc::new(std::sync::Mutex::new((0, 0)));
        let mut pipeline = Pipeline::from_config(&config(2, 1))
            .unwrap()
            .with_observer(Box::new(Counter(counts.clone())));

        let (tx, rx) = mpsc::channel(16);
        for i in 0..5 {
            tx.send(sample(i, 100.0 + i as f64, 1.0)).await.unwrap();
        }
        drop(tx);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let summary = pipeline.run(rx, shutdown_rx).await;
        assert_eq!(summary.samples, 5);
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.discarded, 1);
        assert!(!summary.cancelled);
        assert_eq!(*counts.lock().unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut pipeline = Pipeline::from_config(&config(2, 1)).unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(sample(0, 100.0, 1.0)).await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();

        let summary = pipeline.run(rx, shutdown_rx).await;
        assert!(summary.cancelled);
        assert_eq!(summary.ticks, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_shutdown_channel_does_not_cancel() {
        let mut pipeline = Pipeline::from_config(&config(2, 1)).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let shutdown_rx = broadcast::channel::<()>(1).0.subscribe();

        let producer = tokio::spawn(async move {
            for i in 0..6 {
                tx.send(sample(i, 100.0 + i as f64, 1.0)).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let summary = pipeline.run(rx, shutdown_rx).await;
        producer.await.unwrap();
        assert!(!summary.cancelled);
        assert_eq!(summary.samples, 6);
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.discarded, 0);
    }

    #[test]
    fn test_backtest_recorder_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backtests").join("report.json");
        let mut recorder = BacktestRecorder::new(&path);

        let block = vec![sample(0, 100.0, 1.0), sample(1, 101.0, 1.0)];
        let point_sample = Arc::new(block[0].clone());
        let points = vec![Point::new(100.5, 2.0, block[0].timestamp, point_sample)];
        let series = vec![Series::new(0, points[0].clone())];
        let report = TickReport {
            index: 0,
            time: block[0].timestamp,
            points: 1,
            new_series: 1,
            dispatched: vec![DispatchRecord {
                series_id: 0,
                time: block[0].timestamp,
                signal_type: SignalType::Hold,
            }],
        };

        recorder.on_tick(&Tick {
            report: &report,
            block: &block,
            points: &points,
            series: &series,
        });
        recorder.on_finish(&series);

        assert_eq!(recorder.report().market_data.len(), 2);
        assert_eq!(recorder.report().metrics.total_series, 1);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["marketData"].as_array().unwrap().len(), 2);
        assert_eq!(json["clusteredMarketData"].as_array().unwrap().len(), 1);
        assert_eq!(json["signals"][0]["type"], "hold");
        assert_eq!(json["metrics"]["totalSeries"], 1);
    }
}
