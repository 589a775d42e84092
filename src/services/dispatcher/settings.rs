use super::{
    ActionHandler, Dispatcher, FileLoggerHandler, LoggerHandler, PositionAwareHandler, SignalRule,
    VolumeTrendRule,
};
use crate::error::{PipelineError, Result};
use crate::types::SignalType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type RuleFactory = fn(&Map<String, Value>) -> Result<Box<dyn SignalRule>>;
type HandlerFactory = fn(&Map<String, Value>) -> Result<Arc<dyn ActionHandler>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherSettings {
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
    #[serde(default)]
    pub handlers: HashMap<SignalType, Vec<HandlerSettings>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn volume_trend_rule(config: &Map<String, Value>) -> Result<Box<dyn SignalRule>> {
    Ok(Box::new(VolumeTrendRule::from_map(config)?))
}

fn logger_handler(config: &Map<String, Value>) -> Result<Arc<dyn ActionHandler>> {
    Ok(Arc::new(LoggerHandler::from_map(config)?))
}

fn file_handler(config: &Map<String, Value>) -> Result<Arc<dyn ActionHandler>> {
    Ok(Arc::new(FileLoggerHandler::from_map(config)?))
}

fn position_handler(config: &Map<String, Value>) -> Result<Arc<dyn ActionHandler>> {
    Ok(Arc::new(PositionAwareHandler::from_map(config)?))
}

fn rule_factory(name: &str) -> Option<RuleFactory> {
    match name {
        // "volume_trand" is the spelling older strategy files use
        "volume_trend" | "volume_trand" => Some(volume_trend_rule),
        _ => None,
    }
}

fn handler_factory(name: &str) -> Option<HandlerFactory> {
    match name {
        "logger" => Some(logger_handler),
        "file" => Some(file_handler),
        "position" => Some(position_handler),
        _ => None,
    }
}

fn build_rule(settings: &RuleSettings) -> Result<Box<dyn SignalRule>> {
    let factory = rule_factory(&settings.kind).ok_or_else(|| PipelineError::UnknownType {
        kind: "rule",
        name: settings.kind.clone(),
    })?;
    factory(&settings.config).map_err(|e| PipelineError::Factory {
        kind: "rule",
        name: settings.kind.clone(),
        reason: e.to_string(),
    })
}

fn build_handler(settings: &HandlerSettings) -> Result<Arc<dyn ActionHandler>> {
    let factory = handler_factory(&settings.kind).ok_or_else(|| PipelineError::UnknownType {
        kind: "handler",
        name: settings.kind.clone(),
    })?;
    factory(&settings.config).map_err(|e| PipelineError::Factory {
        kind: "handler",
        name: settings.kind.clone(),
        reason: e.to_string(),
    })
}

impl Dispatcher {
    /// Build rules and handlers from settings. Any unknown type or bad
    /// config fails the whole dispatcher.
    pub fn from_settings(settings: &DispatcherSettings) -> Result<Self> {
        let rules = settings
            .rules
            .iter()
            .map(build_rule)
            .collect::<Result<Vec<_>>>()?;
        let mut dispatcher = Dispatcher::with_rules(rules);

        // fixed type order keeps construction deterministic
        for signal_type in [SignalType::Buy, SignalType::Sell, SignalType::Hold] {
            for handler in settings.handlers.get(&signal_type).into_iter().flatten() {
                dispatcher.register(signal_type, build_handler(handler)?);
            }
        }

        info!(
            "Dispatcher built: {} rule(s), {}/{}/{} buy/sell/hold handler(s)",
            dispatcher.rule_count(),
            dispatcher.handler_count(SignalType::Buy),
            dispatcher.handler_count(SignalType::Sell),
            dispatcher.handler_count(SignalType::Hold)
        );
        Ok(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> DispatcherSettings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_from_settings() {
        let settings = parse(
            r#"{
                "rules": [{ "type": "volume_trend", "config": { "min_volume_change_percent": 10 } }],
                "handlers": {
                    "buy": [{ "type": "logger" }, { "type": "position" }],
                    "sell": [{ "type": "position" }]
                }
            }"#,
        );
        let dispatcher = Dispatcher::from_settings(&settings).unwrap();
        assert_eq!(dispatcher.rule_count(), 1);
        assert_eq!(dispatcher.handler_count(SignalType::Buy), 2);
        assert_eq!(dispatcher.handler_count(SignalType::Sell), 1);
        assert_eq!(dispatcher.handler_count(SignalType::Hold), 0);
    }

    #[test]
    fn test_legacy_rule_name() {
        let settings = parse(r#"{ "rules": [{ "type": "volume_trand", "config": { "min_volume_change_percent": 5 } }] }"#);
        assert_eq!(Dispatcher::from_settings(&settings).unwrap().rule_count(), 1);
    }

    #[test]
    fn test_unknown_rule() {
        let settings = parse(r#"{ "rules": [{ "type": "rsi" }] }"#);
        let err = Dispatcher::from_settings(&settings).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownType { kind: "rule", .. }));
    }

    #[test]
    fn test_unknown_handler() {
        let settings = parse(r#"{ "handlers": { "buy": [{ "type": "exchange" }] } }"#);
        let err = Dispatcher::from_settings(&settings).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownType { kind: "handler", .. }));
    }

    #[test]
    fn test_bad_handler_config() {
        let settings = parse(r#"{ "handlers": { "sell": [{ "type": "file" }] } }"#);
        let err = Dispatcher::from_settings(&settings).unwrap_err();
        assert!(matches!(err, PipelineError::Factory { kind: "handler", .. }));
    }

    #[test]
    fn test_bad_rule_config() {
        let settings = parse(r#"{ "rules": [{ "type": "volume_trend", "config": {} }] }"#);
        let err = Dispatcher::from_settings(&settings).unwrap_err();
        assert!(matches!(err, PipelineError::Factory { kind: "rule", .. }));
    }

    #[test]
    fn test_unknown_signal_type_key() {
        let result: std::result::Result<DispatcherSettings, _> =
            serde_json::from_str(r#"{ "handlers": { "short": [] } }"#);
        assert!(result.is_err());
    }
}
