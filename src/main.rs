use anyhow::Context;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradepipe::services::{
    group_by_stream, load_strategies, run_group, GroupRunOptions, HistoricalSource, StrategyRun,
};
use tradepipe::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradepipe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        "Starting backtest: {} strategy path(s), samples {}",
        config.strategy_paths.len(),
        config.samples_file.display()
    );

    let strategies = load_strategies(&config.strategy_paths).context("loading strategies")?;
    let groups = group_by_stream(strategies);
    let samples = HistoricalSource::read_samples(&config.samples_file)
        .with_context(|| format!("loading samples {}", config.samples_file.display()))?;
    let report_dir = config.output_dir.join("backtests");
    std::fs::create_dir_all(&report_dir)
        .with_context(|| format!("creating {}", report_dir.display()))?;

    // Ctrl-C stops every pipeline after the sample in progress
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    let options = GroupRunOptions {
        report_dir,
        series_dir: config.dump_series.then(|| config.output_dir.join("series")),
        started: Utc::now(),
        capacity: config.channel_capacity,
    };

    // One replayed stream per symbol|interval, shared by its strategies
    let mut tasks = Vec::with_capacity(groups.len());
    for group in groups {
        let group_samples: Vec<_> = samples
            .iter()
            .filter(|s| s.symbol == group.symbol)
            .cloned()
            .collect();
        if group_samples.is_empty() {
            warn!("No samples for {}, its strategies still report", group.key());
        }

        let options = options.clone();
        let shutdown_tx = shutdown_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut source = HistoricalSource::new(group_samples, options.capacity);
            let runs = run_group(&group, &mut source, &options, &shutdown_tx).await;
            (group.key(), runs)
        }));
    }

    for task in tasks {
        let (key, runs) = task.await.context("strategy group task failed")?;
        let runs = runs.with_context(|| format!("running {}", key))?;
        for run in &runs {
            log_run(&key, run)?;
        }
    }

    Ok(())
}

fn log_run(key: &str, run: &StrategyRun) -> anyhow::Result<()> {
    info!(
        "{} strategy {} ({}): {}",
        key,
        run.name,
        run.report_path.display(),
        serde_json::to_string(&run.summary)?
    );
    Ok(())
}
