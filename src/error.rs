use thiserror::Error;

/// Pipeline error types.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Missing config key: {0}")]
    MissingKey(String),

    #[error("Invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    #[error("Unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },

    #[error("Failed to create {kind} `{name}`: {reason}")]
    Factory {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Broadcaster already started")]
    AlreadyStarted,

    #[error("Sample source already consumed")]
    SourceConsumed,

    #[error("Pipeline task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
