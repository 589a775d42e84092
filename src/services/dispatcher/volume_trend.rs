use super::SignalRule;
use crate::config::{check_keys, require_f64};
use crate::error::{PipelineError, Result};
use crate::types::{Series, SignalType, TradeSignal};
use serde_json::{Map, Value};

/// Fires when buy or sell volume grew by more than a threshold between the
/// last two points, and more than the other side did.
#[derive(Debug, Clone)]
pub struct VolumeTrendRule {
    min_volume_change_percent: f64,
}

impl VolumeTrendRule {
    pub fn new(min_volume_change_percent: f64) -> Result<Self> {
        if !min_volume_change_percent.is_finite() || min_volume_change_percent < 0.0 {
            return Err(PipelineError::invalid(
                "min_volume_change_percent",
                "must be a finite number >= 0",
            ));
        }
        Ok(Self {
            min_volume_change_percent,
        })
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        check_keys(map, &["min_volume_change_percent"])?;
        Self::new(require_f64(map, "min_volume_change_percent")?)
    }

    pub fn min_volume_change_percent(&self) -> f64 {
        self.min_volume_change_percent
    }
}

/// Percentage change from `prev` to `last`. None when undefined.
fn percent_change(prev: f64, last: f64) -> Option<f64> {
    if prev == 0.0 {
        return None;
    }
    let change = (last - prev) / prev * 100.0;
    change.is_finite().then_some(change)
}

impl SignalRule for VolumeTrendRule {
    fn name(&self) -> &str {
        "volume_trend"
    }

    fn evaluate(&self, series: &Series) -> Option<TradeSignal> {
        let prev = series.previous()?;
        let last = series.last()?;

        let buy = percent_change(prev.sample.buy_volume, last.sample.buy_volume)?;
        let sell = percent_change(prev.sample.sell_volume, last.sample.sell_volume)?;

        let signal_type = if buy > self.min_volume_change_percent && buy > sell {
            SignalType::Buy
        } else if sell > self.min_volume_change_percent && sell > buy {
            SignalType::Sell
        } else {
            return None;
        };

        let description = format!("volume_trend: buy {:+.1}%, sell {:+.1}%", buy, sell);
        TradeSignal::from_series(series, signal_type, &description)
    }
}
