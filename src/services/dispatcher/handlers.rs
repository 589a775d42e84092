use super::ActionHandler;
use crate::config::{check_keys, require_str};
use crate::error::Result;
use crate::types::{SignalType, TradeSignal};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Emits one tracing event per signal.
#[derive(Debug, Default)]
pub struct LoggerHandler;

impl LoggerHandler {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        check_keys(map, &[])?;
        Ok(Self)
    }
}

impl ActionHandler for LoggerHandler {
    fn name(&self) -> &str {
        "logger"
    }

    fn handle(&self, signal: TradeSignal) {
        info!(
            symbol = %signal.symbol,
            series = signal.series.id,
            "[{}] {} @ {:.2} | vol {:.2} | {}",
            signal.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            signal.signal_type,
            signal.price,
            signal.volume,
            signal.description
        );
    }
}

/// Appends one line per signal to a file.
pub struct FileLoggerHandler {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLoggerHandler {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        check_keys(map, &["path"])?;
        Self::open(require_str(map, "path")?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_line(signal: &TradeSignal) -> String {
        format!(
            "{} [{}] {} {:.2} {:.2}\n",
            signal.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            signal.signal_type,
            signal.symbol,
            signal.price,
            signal.volume
        )
    }
}

impl ActionHandler for FileLoggerHandler {
    fn name(&self) -> &str {
        "file"
    }

    fn handle(&self, signal: TradeSignal) {
        let line = Self::format_line(&signal);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Failed to write signal to {}: {}", self.path.display(), e);
        }
    }
}

/// An open paper position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub open_time: DateTime<Utc>,
}

impl Position {
    pub fn pnl_at(&self, exit_price: f64, quantity: f64) -> f64 {
        (exit_price - self.entry_price) * quantity
    }
}

/// Paper position tracker, one position per symbol.
///
/// Buy opens a position sized by the signal volume when flat. Sell reduces
/// the open position by up to the signal volume and realizes PnL on the
/// reduced quantity. Hold is ignored.
#[derive(Debug, Default)]
pub struct PositionAwareHandler {
    positions: DashMap<String, Position>,
    realized_pnl: DashMap<String, f64>,
}

impl PositionAwareHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        check_keys(map, &[])?;
        Ok(Self::new())
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.clone())
    }

    pub fn realized_pnl(&self, symbol: &str) -> f64 {
        self.realized_pnl.get(symbol).map_or(0.0, |v| *v)
    }

    fn buy(&self, signal: &TradeSignal) {
        if signal.volume <= 0.0 {
            debug!("Ignoring buy for {}: zero volume", signal.symbol);
            return;
        }
        if let Some(open) = self.positions.get(&signal.symbol) {
            debug!(
                "Ignoring buy for {}: position open {:.4} @ {:.2}",
                signal.symbol, open.quantity, open.entry_price
            );
            return;
        }

        info!(
            "[BUY] {} @ {:.2} x {:.4}",
            signal.symbol, signal.price, signal.volume
        );
        self.positions.insert(
            signal.symbol.clone(),
            Position {
                symbol: signal.symbol.clone(),
                quantity: signal.volume,
                entry_price: signal.price,
                open_time: signal.timestamp,
            },
        );
    }

    fn sell(&self, signal: &TradeSignal) {
        let (pnl, remaining) = {
            let Some(mut open) = self.positions.get_mut(&signal.symbol) else {
                debug!("Ignoring sell for {}: no open position", signal.symbol);
                return;
            };
            let quantity = open.quantity.min(signal.volume);
            let pnl = open.pnl_at(signal.price, quantity);
            open.quantity -= quantity;
            info!(
                "[SELL] {} @ {:.2} x {:.4} (pnl {:.2})",
                signal.symbol, signal.price, quantity, pnl
            );
            (pnl, open.quantity)
        };

        *self.realized_pnl.entry(signal.symbol.clone()).or_insert(0.0) += pnl;

        if remaining <= 0.0 {
            self.positions.remove(&signal.symbol);
            info!(
                "[CLOSED] {} realized pnl {:.2}",
                signal.symbol,
                self.realized_pnl(&signal.symbol)
            );
        }
    }
}

impl ActionHandler for PositionAwareHandler {
    fn name(&self) -> &str {
        "position"
    }

    fn handle(&self, signal: TradeSignal) {
        match signal.signal_type {
            SignalType::Buy => self.buy(&signal),
            SignalType::Sell => self.sell(&signal),
            SignalType::Hold => {}
        }
    }
}

/// Forwards signals to another task over a bounded channel.
///
/// Never blocks the dispatcher: a full channel drops the signal.
pub struct ChannelHandler {
    tx: mpsc::Sender<TradeSignal>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TradeSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::Sender<TradeSignal>) -> Self {
        Self { tx }
    }
}

impl ActionHandler for ChannelHandler {
    fn name(&self) -> &str {
        "channel"
    }

    fn handle(&self, signal: TradeSignal) {
        match self.tx.try_send(signal) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(signal)) => {
                warn!(
                    "Signal channel full, dropping {} for {}",
                    signal.signal_type, signal.symbol
                );
            }
            Err(mpsc::error::TrySendError::Closed(signal)) => {
                debug!(
                    "Signal channel closed, dropping {} for {}",
                    signal.signal_type, signal.symbol
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Sample, Series};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn signal(signal_type: SignalType, price: f64, volume: f64) -> TradeSignal {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sample = Sample::new(time, "BTCUSDT", "1m", price, volume, 0.0, 0.0);
        let series = Series::new(0, Point::new(price, volume, time, Arc::new(sample)));
        TradeSignal::from_series(&series, signal_type, "test").unwrap()
    }

    #[test]
    fn test_position_open_and_close() {
        let handler = PositionAwareHandler::new();
        handler.handle(signal(SignalType::Buy, 100.0, 2.0));
        let open = handler.position("BTCUSDT").unwrap();
        assert_eq!(open.quantity, 2.0);
        assert_eq!(open.entry_price, 100.0);

        // second buy while open is ignored
        handler.handle(signal(SignalType::Buy, 90.0, 5.0));
        assert_eq!(handler.position("BTCUSDT").unwrap().entry_price, 100.0);

        handler.handle(signal(SignalType::Sell, 110.0, 0.5));
        assert_eq!(handler.position("BTCUSDT").unwrap().quantity, 1.5);
        assert!((handler.realized_pnl("BTCUSDT") - 5.0).abs() < 1e-9);

        handler.handle(signal(SignalType::Sell, 120.0, 10.0));
        assert!(handler.position("BTCUSDT").is_none());
        assert!((handler.realized_pnl("BTCUSDT") - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_ignores_sell_when_flat_and_hold() {
        let handler = PositionAwareHandler::new();
        handler.handle(signal(SignalType::Sell, 100.0, 1.0));
        handler.handle(signal(SignalType::Hold, 100.0, 1.0));
        assert!(handler.position("BTCUSDT").is_none());
        assert_eq!(handler.realized_pnl("BTCUSDT"), 0.0);
    }

    #[test]
    fn test_file_logger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.log");

        let handler = FileLoggerHandler::open(&path).unwrap();
        handler.handle(signal(SignalType::Buy, 100.0, 2.0));
        handler.handle(signal(SignalType::Sell, 101.5, 1.0));
        drop(handler);

        let reopened = FileLoggerHandler::open(&path).unwrap();
        reopened.handle(signal(SignalType::Hold, 99.0, 1.0));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "2024-01-01T00:00:00Z [buy] BTCUSDT 100.00 2.00");
        assert!(lines[1].contains("[sell]"));
        assert!(lines[2].contains("[hold]"));
    }

    #[test]
    fn test_file_logger_requires_path() {
        let map = serde_json::json!({});
        assert!(FileLoggerHandler::from_map(map.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_channel_handler_drops_when_full() {
        let (handler, mut rx) = ChannelHandler::new(1);
        handler.handle(signal(SignalType::Buy, 100.0, 1.0));
        handler.handle(signal(SignalType::Sell, 101.0, 1.0));

        assert_eq!(rx.try_recv().unwrap().signal_type, SignalType::Buy);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_handler_closed_receiver() {
        let (handler, rx) = ChannelHandler::new(4);
        drop(rx);
        handler.handle(signal(SignalType::Buy, 100.0, 1.0));
    }
}
