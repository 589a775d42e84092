use super::{forward_gap, SeriesMatcher};
use crate::types::{Point, Series};

/// Keeps the combined weight denominator away from zero.
const WEIGHT_EPSILON: f64 = 1e-9;

/// A candidate must score below this to be extended.
pub const ACCEPT_THRESHOLD: f64 = 1.0;

/// Nearest-last-point matcher.
///
/// Scores every series that may be extended by
/// `dv * value_factor / w + dt * time_factor / w`, where `w` is the combined
/// weight of the incoming and last point. Heavier points tolerate larger
/// price and time gaps. The lowest score wins if it is below
/// [`ACCEPT_THRESHOLD`].
#[derive(Debug, Clone)]
pub struct SimpleMatcher {
    value_factor: f64,
    time_factor: f64,
}

impl SimpleMatcher {
    pub fn new(value_factor: f64, time_factor: f64) -> Self {
        Self {
            value_factor,
            time_factor,
        }
    }

    /// Match score of `point` against a series ending at `last`.
    pub fn score(&self, last: &Point, point: &Point) -> Option<f64> {
        let dt = forward_gap(last, point)?;
        let dv = (point.value - last.value).abs();
        let combined_weight = point.weight + last.weight + WEIGHT_EPSILON;
        Some(dv * self.value_factor / combined_weight + dt * self.time_factor / combined_weight)
    }
}

impl SeriesMatcher for SimpleMatcher {
    fn name(&self) -> &'static str {
        "SimpleMatcher"
    }

    fn select(&self, series: &[Series], point: &Point) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;

        for (i, s) in series.iter().enumerate() {
            let Some(score) = s.last().and_then(|last| self.score(last, point)) else {
                continue;
            };
            if best.map_or(true, |(_, min)| score < min) {
                best = Some((i, score));
            }
        }

        best.filter(|(_, score)| *score < ACCEPT_THRESHOLD)
            .map(|(i, _)| i)
    }
}
