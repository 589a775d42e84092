use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display format for sample timestamps.
pub const TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Anything that can be ordered by the merge queue.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// One market observation for a symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Set only on samples synthesized by the clusterer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_price: Option<f64>,
    pub volume: f64,
    #[serde(default)]
    pub buy_volume: f64,
    #[serde(default)]
    pub sell_volume: f64,
}

impl Sample {
    /// Create a flat candle (open = high = low = close) with volumes.
    pub fn new(
        timestamp: DateTime<Utc>,
        symbol: &str,
        timeframe: &str,
        price: f64,
        volume: f64,
        buy_volume: f64,
        sell_volume: f64,
    ) -> Self {
        Self {
            timestamp,
            exchange: String::new(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            open: price,
            high: price,
            low: price,
            close: price,
            cluster_price: None,
            volume,
            buy_volume,
            sell_volume,
        }
    }

    /// Builder-style exchange setter.
    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    /// Cluster price if present, otherwise the close.
    pub fn price(&self) -> f64 {
        self.cluster_price.unwrap_or(self.close)
    }
}

impl Timestamped for Sample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl<T: Timestamped> Timestamped for std::sync::Arc<T> {
    fn timestamp(&self) -> DateTime<Utc> {
        self.as_ref().timestamp()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:8.2} {:8.2} {:8.2} {:8.2} {:8.2}",
            self.timestamp.format(TIME_FORMAT),
            self.timeframe,
            self.open,
            self.close,
            self.cluster_price.unwrap_or_default(),
            self.buy_volume,
            self.sell_volume
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sample_serialization_camel_case() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sample = Sample::new(ts, "BTCUSDT", "1m", 100.0, 10.0, 6.0, 4.0);
        let json = serde_json::to_value(&sample).unwrap();

        assert_eq!(json["buyVolume"], 6.0);
        assert_eq!(json["sellVolume"], 4.0);
        assert!(json.get("clusterPrice").is_none());
    }

    #[test]
    fn test_sample_price_prefers_cluster_price() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut sample = Sample::new(ts, "BTCUSDT", "1m", 100.0, 10.0, 6.0, 4.0);
        assert_eq!(sample.price(), 100.0);

        sample.cluster_price = Some(101.5);
        assert_eq!(sample.price(), 101.5);
    }

    #[test]
    fn test_sample_display() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap();
        let sample = Sample::new(ts, "BTCUSDT", "1m", 100.0, 10.0, 6.0, 4.0);
        assert!(sample.to_string().starts_with("05.03.2024 12:30:00 1m"));
    }
}
