//! End-to-end tests for the processing pipeline

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tradepipe::services::dispatcher::{ChannelHandler, PositionAwareHandler, VolumeTrendRule};
use tradepipe::services::{
    BacktestRecorder, BlockAggregator, Clusterer, Dispatcher, MergeQueue, Pipeline, QueueSource,
    Runner, SeriesBuilder, SeriesBuilderConfig,
};
use tradepipe::{PipelineConfig, Sample, Series, SignalType, StrategySettings};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn sample(minute: i64, price: f64, volume: f64, buy: f64, sell: f64) -> Sample {
    Sample::new(t0() + Duration::minutes(minute), "BTCUSDT", "1m", price, volume, buy, sell)
}

/// Volume trend classification recomputed from the two newest points.
fn expected_signal(series: &Series, min_change: f64) -> SignalType {
    let n = series.points.len();
    if n < 2 {
        return SignalType::Hold;
    }
    let prev = &series.points[n - 2].sample;
    let last = &series.points[n - 1].sample;
    if prev.buy_volume == 0.0 || prev.sell_volume == 0.0 {
        return SignalType::Hold;
    }
    let buy = (last.buy_volume - prev.buy_volume) / prev.buy_volume * 100.0;
    let sell = (last.sell_volume - prev.sell_volume) / prev.sell_volume * 100.0;
    if buy > min_change && buy > sell {
        SignalType::Buy
    } else if sell > min_change && sell > buy {
        SignalType::Sell
    } else {
        SignalType::Hold
    }
}

fn block(start_minute: i64, prices: &[f64], volumes: &[f64], buy_share: f64) -> Vec<Sample> {
    prices
        .iter()
        .zip(volumes)
        .enumerate()
        .map(|(i, (&p, &v))| sample(start_minute + i as i64, p, v, v * buy_share, v * (1.0 - buy_share)))
        .collect()
}

#[test]
fn test_five_sample_block_two_clusters() {
    let prices = [100.0, 105.0, 103.0, 107.0, 108.0];
    let volumes = [10.0, 20.0, 15.0, 25.0, 30.0];

    for seed in 0..20 {
        let mut aggregator = BlockAggregator::new(5).unwrap();
        for s in block(0, &prices, &volumes, 0.6) {
            aggregator.add(s);
        }
        assert!(aggregator.is_ready());
        let samples = aggregator.drain_and_reset().unwrap();

        let mut clusterer = Clusterer::new(2, 100).unwrap().with_seed(seed);
        let points = clusterer.cluster_block(&samples);
        assert!(!points.is_empty() && points.len() <= 2);

        // legacy accounting counts buy volume on top of total volume
        let total: f64 = points.iter().map(|p| p.weight).sum();
        assert_eq!(total, 100.0 + 60.0);

        let mut builder = SeriesBuilder::from_config(&SeriesBuilderConfig::Simple {
            value_factor: 1.0,
            time_factor: 0.001,
        })
        .unwrap();
        builder.add_points(points);
        let series = builder.series();
        assert!(!series.is_empty() && series.len() <= 2);

        let dispatcher = Dispatcher::with_rules(vec![Box::new(VolumeTrendRule::new(10.0).unwrap())]);
        for s in series {
            for p in &s.points {
                assert!(p.value >= 100.0 && p.value <= 108.0);
                assert!(p.value >= p.sample.low - 1e-9 && p.value <= p.sample.high + 1e-9);
            }
            assert_eq!(dispatcher.dispatch(s), expected_signal(s, 10.0));
        }
    }
}

#[test]
fn test_second_block_signals_match_volume_deltas() {
    let config = PipelineConfig::from_map(
        serde_json::json!({
            "type": "simple",
            "value_factor": 1.0,
            "time_factor": 0.001,
            "block_size": 5,
            "num_clusters": 2,
            "min_volume_change_percent": 10,
            "seed": 11
        })
        .as_object()
        .unwrap(),
    )
    .unwrap();
    let mut pipeline = Pipeline::from_config(&config).unwrap();

    let first = block(0, &[100.0, 105.0, 103.0, 107.0, 108.0], &[10.0, 20.0, 15.0, 25.0, 30.0], 0.5);
    let second = block(5, &[100.5, 105.5, 103.5, 107.5, 108.5], &[10.0, 20.0, 15.0, 25.0, 30.0], 0.8);

    let mut reports = Vec::new();
    for s in first.into_iter().chain(second) {
        if let Some(report) = pipeline.process_sample(s) {
            reports.push(report);
        }
    }
    assert_eq!(reports.len(), 2);

    let series = pipeline.builder().series();
    for record in &reports[1].dispatched {
        let s = series.iter().find(|s| s.id == record.series_id).unwrap();
        assert_eq!(record.signal_type, expected_signal(s, 10.0));
    }
    for s in series {
        assert!(s.points.windows(2).all(|w| w[0].time < w[1].time));
    }
}

#[tokio::test]
async fn test_rising_buy_volume_reaches_handlers() {
    let mut pipeline = Pipeline::new(
        BlockAggregator::new(2).unwrap(),
        Clusterer::new(1, 100).unwrap().with_seed(5),
        SeriesBuilder::from_config(&SeriesBuilderConfig::Simple {
            value_factor: 1.0,
            time_factor: 0.001,
        })
        .unwrap(),
        Dispatcher::with_rules(vec![Box::new(VolumeTrendRule::new(10.0).unwrap())]),
    );

    let (channel, mut signals) = ChannelHandler::new(16);
    let positions = Arc::new(PositionAwareHandler::new());
    {
        let handle = pipeline.dispatcher();
        let mut dispatcher = handle.write().unwrap();
        dispatcher.register(SignalType::Buy, Arc::new(channel));
        dispatcher.register(SignalType::Buy, positions.clone());
    }

    // buy volume doubles every block while sell volume stays flat
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    for b in 0..6i64 {
        let buy = 10.0 * 2f64.powi(b as i32);
        for j in 0..2 {
            tx.send(sample(b * 2 + j, 100.0 + 0.1 * b as f64, buy + 10.0, buy, 10.0))
                .await
                .unwrap();
        }
    }
    drop(tx);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let summary = pipeline.run(rx, shutdown_rx).await;
    assert_eq!(summary.ticks, 6);
    assert_eq!(summary.signals.buy, 5);
    assert_eq!(summary.metrics.total_series, 1);

    let mut received = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        received.push(signal);
    }
    assert_eq!(received.len(), 5);
    assert!(received.iter().all(|s| s.signal_type == SignalType::Buy));
    // each signal carries the series as it was when dispatched
    let lengths: Vec<usize> = received.iter().map(|s| s.series.len()).collect();
    assert_eq!(lengths, vec![2, 3, 4, 5, 6]);

    let open = positions.position("BTCUSDT").unwrap();
    assert!((open.entry_price - 100.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_strategy_backtest_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let signals_log = dir.path().join("signals.log");
    let strategy = serde_json::json!({
        "symbol": "BTCUSDT",
        "interval": "5m",
        "cluster": { "block_size": 5, "num_clusters": 2, "seed": 42 },
        "series_builder": { "type": "windowed", "max_time_gap": 600, "max_value_diff": 5.0 },
        "dispatcher": {
            "rules": [{ "type": "volume_trend", "config": { "min_volume_change_percent": 10 } }],
            "handlers": {
                "buy": [{ "type": "file", "config": { "path": signals_log.to_str().unwrap() } }],
                "sell": [{ "type": "file", "config": { "path": signals_log.to_str().unwrap() } }]
            }
        }
    });
    let settings = StrategySettings::from_json(&strategy.to_string()).unwrap();

    let report_path = dir
        .path()
        .join("backtests")
        .join(BacktestRecorder::file_name(&settings, t0()));
    assert!(report_path.ends_with("BTCUSDT_5m_20240301T120000Z.json"));

    let mut pipeline = Pipeline::from_settings(&settings)
        .unwrap()
        .with_observer(Box::new(BacktestRecorder::new(&report_path).with_strategy(settings.clone())));

    let samples: Vec<Sample> = (0..23)
        .map(|i| {
            let price = 100.0 + (i % 5) as f64;
            let buy = 5.0 + i as f64;
            sample(i, price, buy + 5.0, buy, 5.0)
        })
        .collect();
    let mut source = tradepipe::services::HistoricalSource::new(samples, 8);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let summary = pipeline.run_source(&mut source, shutdown_rx).await.unwrap();
    assert_eq!(summary.samples, 23);
    assert_eq!(summary.ticks, 4);
    assert_eq!(summary.discarded, 3);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["marketData"].as_array().unwrap().len(), 20);
    assert_eq!(report["strategy"]["interval"], "5m");
    let clustered = report["clusteredMarketData"].as_array().unwrap();
    assert!(!clustered.is_empty());
    assert!(clustered.iter().all(|s| s["timeframe"] == "5m" && s["clusterPrice"].is_number()));
    assert_eq!(
        report["metrics"]["totalSeries"].as_u64().unwrap() as usize,
        report["series"].as_array().unwrap().len()
    );

    let logged = std::fs::read_to_string(&signals_log).unwrap_or_default();
    assert_eq!(
        logged.lines().count() as u64,
        summary.signals.buy + summary.signals.sell
    );
}

#[tokio::test]
async fn test_runner_with_concurrent_producers() {
    let queue = Arc::new(MergeQueue::new());
    let source = QueueSource::new(queue.clone(), 64);

    let config = PipelineConfig::from_map(
        serde_json::json!({
            "type": "simple",
            "value_factor": 1.0,
            "time_factor": 0.001,
            "block_size": 4,
            "num_clusters": 2,
            "min_volume_change_percent": 10,
            "seed": 9
        })
        .as_object()
        .unwrap(),
    )
    .unwrap();
    let runner = Runner::new("BTCUSDT", Pipeline::from_config(&config).unwrap(), Box::new(source));
    runner.start().unwrap();
    assert!(runner.is_running());

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    queue.push(vec![sample(i * 4 + p, 100.0 + p as f64, 10.0, 6.0, 4.0)]);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    queue.close();

    let summary = runner.wait().await.unwrap();
    assert_eq!(summary.samples, 100);
    assert_eq!(summary.ticks, 25);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn test_runner_stop_cancels() {
    let queue = Arc::new(MergeQueue::new());
    let source = QueueSource::new(queue.clone(), 8);
    let config = PipelineConfig::from_map(
        serde_json::json!({
            "type": "windowed",
            "max_time_gap": 120,
            "max_value_diff": 2,
            "block_size": 3,
            "num_clusters": 1,
            "min_volume_change_percent": 10
        })
        .as_object()
        .unwrap(),
    )
    .unwrap();
    let runner = Runner::new("ETHUSDT", Pipeline::from_config(&config).unwrap(), Box::new(source));
    queue.push((0..4).map(|i| sample(i, 2000.0, 1.0, 0.5, 0.5)));
    runner.start().unwrap();

    // producers never finish, so only stop ends the run
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    runner.stop();

    let summary = runner.wait().await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.samples, 4);
    assert_eq!(summary.ticks, 1);
    assert_eq!(summary.discarded, 1);
}
