//! tradepipe - streaming market-data reduction and signal dispatch
//!
//! Samples flow through a block aggregator, a weighted 1-D k-means clusterer
//! and a series builder; every series extended by a block is classified by
//! the dispatcher and routed to signal handlers.

pub mod config;
pub mod error;
pub mod services;
pub mod types;

// Re-export commonly used types
pub use config::{Config, PipelineConfig, StrategySettings};
pub use error::{PipelineError, Result};
pub use types::*;
