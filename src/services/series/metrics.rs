use crate::types::Series;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Summary statistics over a set of series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetrics {
    pub total_series: usize,
    pub total_points: usize,
    pub avg_length: f64,
    pub min_length: usize,
    pub max_length: usize,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SeriesMetrics {
    pub fn collect(series: &[Series]) -> Self {
        let mut m = Self {
            total_series: series.len(),
            ..Default::default()
        };
        if series.is_empty() {
            return m;
        }

        m.min_length = usize::MAX;
        m.min_value = f64::INFINITY;
        m.max_value = f64::NEG_INFINITY;
        let mut value_sum = 0.0;

        for s in series {
            m.total_points += s.len();
            m.min_length = m.min_length.min(s.len());
            m.max_length = m.max_length.max(s.len());

            for p in &s.points {
                value_sum += p.value;
                m.min_value = m.min_value.min(p.value);
                m.max_value = m.max_value.max(p.value);
                m.start_time = Some(m.start_time.map_or(p.time, |t| t.min(p.time)));
                m.end_time = Some(m.end_time.map_or(p.time, |t| t.max(p.time)));
            }
        }

        m.avg_length = m.total_points as f64 / m.total_series as f64;
        if m.total_points > 0 {
            m.avg_value = value_sum / m.total_points as f64;
        } else {
            m.min_value = 0.0;
            m.max_value = 0.0;
        }
        m
    }

    pub fn log(&self) {
        info!(
            "Series: {} total, {} points, length avg {:.2} (min {}, max {})",
            self.total_series, self.total_points, self.avg_length, self.min_length, self.max_length
        );
        info!(
            "Values: avg {:.4} (min {:.4}, max {:.4})",
            self.avg_value, self.min_value, self.max_value
        );
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            info!("Time range: {} - {} ({})", start, end, end - start);
        }
    }
}
