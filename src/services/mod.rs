pub mod aggregator;
pub mod backtest;
pub mod broadcaster;
pub mod clusters;
pub mod dispatcher;
pub mod merge_queue;
pub mod pipeline;
pub mod runner;
pub mod series;
pub mod sources;

pub use aggregator::BlockAggregator;
pub use backtest::{
    group_by_stream, load_strategies, run_group, GroupRunOptions, NamedStrategy, StrategyGroup,
    StrategyRun,
};
pub use broadcaster::Broadcaster;
pub use clusters::{Clusterer, VolumeAccounting};
pub use dispatcher::{ActionHandler, Dispatcher, DispatcherSettings, SignalRule};
pub use merge_queue::MergeQueue;
pub use pipeline::{
    BacktestRecorder, BacktestReport, Pipeline, RunSummary, SeriesDumpObserver, Tick, TickObserver,
    TickReport,
};
pub use runner::Runner;
pub use series::{SeriesBuilder, SeriesBuilderConfig, SeriesMatcher};
pub use sources::{HistoricalSource, QueueSource, SampleSource};
