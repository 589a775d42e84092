use crate::types::Series;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Classification produced by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

impl SignalType {
    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Buy => write!(f, "buy"),
            SignalType::Sell => write!(f, "sell"),
            SignalType::Hold => write!(f, "hold"),
        }
    }
}

/// A signal derived from one series. Each handler receives its own copy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSignal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Snapshot of the series at evaluation time.
    pub series: Arc<Series>,
    /// Which rule produced the signal.
    pub description: String,
}

impl TradeSignal {
    /// Build a signal from the last point of a series.
    /// Returns None for an empty series.
    pub fn from_series(series: &Series, signal_type: SignalType, description: &str) -> Option<Self> {
        let last = series.last()?;
        Some(Self {
            timestamp: last.time,
            symbol: last.sample.symbol.clone(),
            price: last.value,
            volume: last.sample.volume,
            buy_volume: last.sample.buy_volume,
            sell_volume: last.sample.sell_volume,
            signal_type,
            series: Arc::new(series.clone()),
            description: description.to_string(),
        })
    }
}
