use crate::types::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A cluster re-expressed as series input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Cluster center (price level).
    pub value: f64,
    /// Aggregated volume of the cluster.
    pub weight: f64,
    pub time: DateTime<Utc>,
    /// Sample the point was formed from.
    pub sample: Arc<Sample>,
}

impl Point {
    pub fn new(value: f64, weight: f64, time: DateTime<Utc>, sample: Arc<Sample>) -> Self {
        Self {
            value,
            weight,
            time,
            sample,
        }
    }
}

/// Ordered, append-only trajectory of points, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: usize,
    pub points: Vec<Point>,
}

impl Series {
    /// Start a new series from its first point.
    pub fn new(id: usize, first: Point) -> Self {
        Self {
            id,
            points: vec![first],
        }
    }

    pub fn first(&self) -> Option<&Point> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&Point> {
        self.points.last()
    }

    /// Point before the last one.
    pub fn previous(&self) -> Option<&Point> {
        self.points.len().checked_sub(2).and_then(|i| self.points.get(i))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True when the last point is not older than `timestamp`.
    pub fn is_active_at(&self, timestamp: DateTime<Utc>) -> bool {
        self.last().map(|p| p.time >= timestamp).unwrap_or(false)
    }

    pub(crate) fn push(&mut self, point: Point) {
        self.points.push(point);
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FMT: &str = "%Y-%m-%d %H:%M:%S";
        match (self.first(), self.last()) {
            (Some(first), Some(last)) if self.points.len() > 1 => write!(
                f,
                "({})[{} ${:.2} - {} ${:.2}]",
                self.points.len(),
                first.time.format(FMT),
                first.value,
                last.time.format(FMT),
                last.value
            ),
            (Some(first), _) => write!(f, "[{} ${:.2}]", first.time.format(FMT), first.value),
            _ => write!(f, "[]"),
        }
    }
}
