//! Weighted one-dimensional k-means over aggregation blocks.
//!
//! Each block of samples is reduced to at most `k` price levels. A level's
//! center is the volume-weighted mean close of its members and its weight is
//! the aggregated volume of those members.

use crate::error::{PipelineError, Result};
use crate::types::{Point, Sample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Centers moving less than this between iterations are converged.
pub const CONVERGENCE_EPSILON: f64 = 1e-6;

/// Default iteration cap.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// How member volumes fold into a cluster's total volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeAccounting {
    /// total = Σ buy_volume + Σ volume (buy side counted twice).
    #[default]
    Legacy,
    /// total = Σ volume.
    Member,
}

impl VolumeAccounting {
    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "legacy" => Some(Self::Legacy),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// A value/weight pair inside one clustering pass.
#[derive(Debug, Clone, Copy)]
pub struct WeightedPoint<'a> {
    pub value: f64,
    pub weight: f64,
    pub sample: &'a Sample,
}

impl<'a> WeightedPoint<'a> {
    /// Close price weighted by volume.
    pub fn from_sample(sample: &'a Sample) -> Self {
        Self {
            value: sample.close,
            weight: sample.volume,
            sample,
        }
    }
}

/// Output of one clustering pass.
#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub center: f64,
    pub members: Vec<WeightedPoint<'a>>,
}

fn distance(a: f64, b: f64) -> f64 {
    (a - b).abs()
}

/// Weighted 1-D k-means.
///
/// Centers are seeded by sampling `k` member values with replacement.
/// Clusters with a non-finite or zero center, or without members, are
/// dropped from the result. Output keeps cluster-index order.
pub fn kmeans_weighted_1d<'a, R: Rng + ?Sized>(
    points: &[WeightedPoint<'a>],
    k: usize,
    max_iterations: usize,
    rng: &mut R,
) -> Vec<Cluster<'a>> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut centers: Vec<f64> = (0..k)
        .map(|_| points[rng.gen_range(0..points.len())].value)
        .collect();
    let mut members: Vec<Vec<WeightedPoint<'a>>> = vec![Vec::new(); k];

    for _ in 0..max_iterations {
        for m in members.iter_mut() {
            m.clear();
        }

        for p in points {
            let mut closest = 0;
            let mut min_dist = f64::MAX;
            for (i, c) in centers.iter().enumerate() {
                let d = distance(p.value, *c);
                if d < min_dist {
                    min_dist = d;
                    closest = i;
                }
            }
            members[closest].push(*p);
        }

        let mut converged = true;
        for (center, assigned) in centers.iter_mut().zip(&members) {
            let total_weight: f64 = assigned.iter().map(|p| p.weight).sum();
            if assigned.is_empty() || total_weight == 0.0 {
                continue;
            }
            let weighted_sum: f64 = assigned.iter().map(|p| p.value * p.weight).sum();
            let updated = weighted_sum / total_weight;
            if distance(*center, updated) >= CONVERGENCE_EPSILON {
                converged = false;
            }
            *center = updated;
        }

        if converged {
            break;
        }
    }

    centers
        .into_iter()
        .zip(members)
        .filter(|(center, assigned)| center.is_finite() && *center != 0.0 && !assigned.is_empty())
        .map(|(center, members)| Cluster { center, members })
        .collect()
}

/// Reduces aggregation blocks to series points.
pub struct Clusterer {
    num_clusters: usize,
    max_iterations: usize,
    accounting: VolumeAccounting,
    timeframe: Option<String>,
    rng: StdRng,
}

impl Clusterer {
    /// Create a clusterer seeded from OS entropy.
    pub fn new(num_clusters: usize, max_iterations: usize) -> Result<Self> {
        if num_clusters == 0 {
            return Err(PipelineError::invalid("num_clusters", "must be >= 1"));
        }
        if max_iterations == 0 {
            return Err(PipelineError::invalid("max_iterations", "must be >= 1"));
        }
        Ok(Self {
            num_clusters,
            max_iterations,
            accounting: VolumeAccounting::default(),
            timeframe: None,
            rng: StdRng::from_entropy(),
        })
    }

    /// Use a fixed seed so runs are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_accounting(mut self, accounting: VolumeAccounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Timeframe label stamped on synthesized samples.
    pub fn with_timeframe(mut self, timeframe: &str) -> Self {
        self.timeframe = Some(timeframe.to_string());
        self
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// Cluster one block and convert the surviving clusters to points.
    pub fn cluster_block(&mut self, block: &[Sample]) -> Vec<Point> {
        let Some(first) = block.first() else {
            return Vec::new();
        };

        let points: Vec<WeightedPoint<'_>> = block.iter().map(WeightedPoint::from_sample).collect();
        let clusters = kmeans_weighted_1d(&points, self.num_clusters, self.max_iterations, &mut self.rng);

        clusters
            .iter()
            .map(|cluster| {
                let sample = self.synthesize(first, cluster);
                Point::new(cluster.center, sample.volume, first.timestamp, Arc::new(sample))
            })
            .collect()
    }

    fn synthesize(&self, first: &Sample, cluster: &Cluster<'_>) -> Sample {
        let mut sample = Sample {
            timestamp: first.timestamp,
            exchange: first.exchange.clone(),
            symbol: first.symbol.clone(),
            timeframe: self
                .timeframe
                .clone()
                .unwrap_or_else(|| first.timeframe.clone()),
            open: 0.0,
            high: f64::MIN,
            low: f64::MAX,
            close: 0.0,
            cluster_price: Some(cluster.center),
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
        };

        for member in &cluster.members {
            let md = member.sample;
            sample.high = sample.high.max(md.high);
            sample.low = sample.low.min(md.low);
            sample.buy_volume += md.buy_volume;
            sample.sell_volume += md.sell_volume;
            sample.volume += md.volume;
            if self.accounting == VolumeAccounting::Legacy {
                sample.volume += md.buy_volume;
            }
        }

        // members keep block order
        if let (Some(head), Some(tail)) = (cluster.members.first(), cluster.members.last()) {
            sample.open = head.sample.open;
            sample.close = tail.sample.close;
        }

        sample
    }
}
