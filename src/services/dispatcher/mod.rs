//! Signal dispatch.
//!
//! Rules classify a series; the first rule that fires decides the signal,
//! which is then handed to every handler registered for its type.

pub mod handlers;
pub mod settings;
pub mod volume_trend;

pub use handlers::{ChannelHandler, FileLoggerHandler, LoggerHandler, Position, PositionAwareHandler};
pub use settings::{DispatcherSettings, HandlerSettings, RuleSettings};
pub use volume_trend::VolumeTrendRule;

use crate::types::{Series, SignalType, TradeSignal};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Classifies a series. Returning None lets the next rule try.
pub trait SignalRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, series: &Series) -> Option<TradeSignal>;
}

/// Side-effecting consumer of dispatched signals.
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str {
        "handler"
    }

    fn handle(&self, signal: TradeSignal);
}

impl<F> ActionHandler for F
where
    F: Fn(TradeSignal) + Send + Sync,
{
    fn handle(&self, signal: TradeSignal) {
        self(signal)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    rules: Vec<Box<dyn SignalRule>>,
    handlers: HashMap<SignalType, Vec<Arc<dyn ActionHandler>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rules", &self.rules.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Box<dyn SignalRule>>) -> Self {
        Self {
            rules,
            handlers: HashMap::new(),
        }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn SignalRule>) {
        self.rules.push(rule);
    }

    /// Register a handler. Handlers of one type run in registration order.
    pub fn register(&mut self, signal_type: SignalType, handler: Arc<dyn ActionHandler>) {
        self.handlers.entry(signal_type).or_default().push(handler);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn handler_count(&self, signal_type: SignalType) -> usize {
        self.handlers.get(&signal_type).map_or(0, Vec::len)
    }

    /// Classify `series` and deliver the signal. Returns the type dispatched.
    ///
    /// When no rule fires the result is Hold, and a Hold signal built from the
    /// last point is delivered only if Hold handlers are registered.
    pub fn dispatch(&self, series: &Series) -> SignalType {
        let fired = self.rules.iter().find_map(|rule| rule.evaluate(series));

        let signal_type = fired.as_ref().map_or(SignalType::Hold, |s| s.signal_type);
        let Some(handlers) = self.handlers.get(&signal_type).filter(|h| !h.is_empty()) else {
            return signal_type;
        };

        let signal = match fired {
            Some(signal) => signal,
            None => match TradeSignal::from_series(series, SignalType::Hold, "no rule matched") {
                Some(signal) => signal,
                None => return signal_type,
            },
        };

        debug!(
            "Dispatching {} for series {} to {} handler(s)",
            signal_type,
            series.id,
            handlers.len()
        );
        for handler in handlers {
            handler.handle(signal.clone());
        }
        signal_type
    }
}
