use super::{SeriesBuilderConfig, SeriesMatcher, SeriesMetrics};
use crate::error::Result;
use crate::types::{Point, Series};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Owns the set of series and grows it batch by batch.
///
/// Not synchronized: one pipeline loop drives it. Consumers on other tasks
/// should take a [`SeriesBuilder::snapshot`].
pub struct SeriesBuilder {
    matcher: Box<dyn SeriesMatcher>,
    series: Vec<Series>,
    last_update: Option<DateTime<Utc>>,
    next_id: usize,
}

impl SeriesBuilder {
    pub fn new(matcher: Box<dyn SeriesMatcher>) -> Self {
        Self {
            matcher,
            series: Vec::new(),
            last_update: None,
            next_id: 0,
        }
    }

    /// Build from a parsed config. Invalid coefficients fail here.
    pub fn from_config(config: &SeriesBuilderConfig) -> Result<Self> {
        Ok(Self::new(config.build()?))
    }

    /// Build from a `{type, ...}` key/value map.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        Self::from_config(&SeriesBuilderConfig::from_map(map)?)
    }

    pub fn matcher_name(&self) -> &'static str {
        self.matcher.name()
    }

    /// Place each point of a batch, in order. Returns the number of new
    /// series started.
    pub fn add_points(&mut self, points: Vec<Point>) -> usize {
        let Some(batch_time) = points.last().map(|p| p.time) else {
            return 0;
        };

        let mut started = 0;
        for point in points {
            match self.matcher.select(&self.series, &point) {
                Some(i) => self.series[i].push(point),
                None => {
                    self.series.push(Series::new(self.next_id, point));
                    self.next_id += 1;
                    started += 1;
                }
            }
        }

        self.last_update = Some(batch_time);
        debug!(
            "{}: {} series ({} new) at {}",
            self.matcher.name(),
            self.series.len(),
            started,
            batch_time
        );
        started
    }

    /// Series extended by the latest batch.
    pub fn active_series(&self) -> Vec<&Series> {
        let Some(ts) = self.last_update else {
            return Vec::new();
        };
        self.series.iter().filter(|s| s.is_active_at(ts)).collect()
    }

    /// All series, in creation order.
    pub fn series(&self) -> &[Series] {
        &self.series
    }

    /// Owned copies for readers outside the pipeline loop.
    pub fn snapshot(&self) -> Vec<Arc<Series>> {
        self.series.iter().cloned().map(Arc::new).collect()
    }

    /// Time of the most recently ingested batch.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn metrics(&self) -> SeriesMetrics {
        SeriesMetrics::collect(&self.series)
    }

    pub fn into_series(self) -> Vec<Series> {
        self.series
    }
}
