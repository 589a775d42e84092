use super::{forward_gap, SeriesMatcher};
use crate::types::{Point, Series};

/// First-fit matcher over a time window and price band.
///
/// The oldest series whose last point lies within `max_time_gap` seconds and
/// less than `max_value_diff` away in price receives the point.
#[derive(Debug, Clone)]
pub struct WindowedMatcher {
    max_time_gap: f64,
    max_value_diff: f64,
}

impl WindowedMatcher {
    pub fn new(max_time_gap: f64, max_value_diff: f64) -> Self {
        Self {
            max_time_gap,
            max_value_diff,
        }
    }
}

impl SeriesMatcher for WindowedMatcher {
    fn name(&self) -> &'static str {
        "WindowedMatcher"
    }

    fn select(&self, series: &[Series], point: &Point) -> Option<usize> {
        series.iter().position(|s| {
            s.last().map_or(false, |last| {
                forward_gap(last, point).map_or(false, |dt| {
                    dt <= self.max_time_gap && (point.value - last.value).abs() < self.max_value_diff
                })
            })
        })
    }
}
