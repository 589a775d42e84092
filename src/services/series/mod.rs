//! Series building.
//!
//! Points emitted for successive blocks are stitched into series by a
//! pluggable matcher. The matcher only picks a target; the builder owns the
//! series and applies the choice, so a point is placed exactly once.

pub mod builder;
pub mod metrics;
pub mod simple;
pub mod windowed;

pub use builder::SeriesBuilder;
pub use metrics::SeriesMetrics;
pub use simple::SimpleMatcher;
pub use windowed::WindowedMatcher;

use crate::config::{check_keys, optional_str, require_f64, require_str};
use crate::error::{PipelineError, Result};
use crate::types::{Point, Series};
use serde_json::{Map, Value};

/// Strategy deciding which series a new point extends.
pub trait SeriesMatcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Index of the series that should receive `point`,
    /// or None to start a new series.
    fn select(&self, series: &[Series], point: &Point) -> Option<usize>;
}

/// Seconds from `last` to `point`, or None when the point may not extend a
/// series ending at `last` (same tick, or earlier in time).
pub(crate) fn forward_gap(last: &Point, point: &Point) -> Option<f64> {
    if point.time <= last.time {
        return None;
    }
    (point.time - last.time).to_std().ok().map(|d| d.as_secs_f64())
}

/// Matcher selection and coefficients.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesBuilderConfig {
    Simple { value_factor: f64, time_factor: f64 },
    Windowed { max_time_gap: f64, max_value_diff: f64 },
}

impl SeriesBuilderConfig {
    /// Parse `{type, ...coefficients}`. Unknown types and keys are rejected.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let kind = require_str(map, "type")?;
        let config = match kind.as_str() {
            "simple" => {
                check_keys(map, &["type", "value_factor", "time_factor"])?;
                Self::Simple {
                    value_factor: require_f64(map, "value_factor")?,
                    time_factor: require_f64(map, "time_factor")?,
                }
            }
            "windowed" => {
                check_keys(map, &["type", "max_time_gap", "max_value_diff"])?;
                Self::Windowed {
                    max_time_gap: require_f64(map, "max_time_gap")?,
                    max_value_diff: require_f64(map, "max_value_diff")?,
                }
            }
            other => {
                return Err(PipelineError::UnknownType {
                    kind: "series builder",
                    name: other.to_string(),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Like `from_map` but tolerates keys that belong to other components.
    pub(crate) fn from_shared_map(map: &Map<String, Value>) -> Result<Self> {
        let kind = optional_str(map, "type")?
            .ok_or_else(|| PipelineError::MissingKey("type".to_string()))?;
        let mut own = Map::new();
        own.insert("type".to_string(), Value::String(kind.clone()));
        let keys: &[&str] = match kind.as_str() {
            "windowed" => &["max_time_gap", "max_value_diff"],
            _ => &["value_factor", "time_factor"],
        };
        for key in keys {
            if let Some(v) = map.get(*key) {
                own.insert(key.to_string(), v.clone());
            }
        }
        Self::from_map(&own)
    }

    pub fn validate(&self) -> Result<()> {
        fn non_negative(key: &str, v: f64) -> Result<()> {
            if !v.is_finite() || v < 0.0 {
                return Err(PipelineError::invalid(key, "must be a finite number >= 0"));
            }
            Ok(())
        }

        match *self {
            Self::Simple {
                value_factor,
                time_factor,
            } => {
                non_negative("value_factor", value_factor)?;
                non_negative("time_factor", time_factor)?;
                if value_factor == 0.0 && time_factor == 0.0 {
                    return Err(PipelineError::invalid(
                        "value_factor",
                        "value_factor and time_factor cannot both be 0",
                    ));
                }
            }
            Self::Windowed {
                max_time_gap,
                max_value_diff,
            } => {
                non_negative("max_time_gap", max_time_gap)?;
                non_negative("max_value_diff", max_value_diff)?;
                if max_value_diff == 0.0 {
                    return Err(PipelineError::invalid("max_value_diff", "must be > 0"));
                }
            }
        }
        Ok(())
    }

    /// Build the matcher this config selects.
    pub fn build(&self) -> Result<Box<dyn SeriesMatcher>> {
        self.validate()?;
        Ok(match *self {
            Self::Simple {
                value_factor,
                time_factor,
            } => Box::new(SimpleMatcher::new(value_factor, time_factor)),
            Self::Windowed {
                max_time_gap,
                max_value_diff,
            } => Box::new(WindowedMatcher::new(max_time_gap, max_value_diff)),
        })
    }
}
