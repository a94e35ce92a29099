use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("INVALID_ROUTING_KEY: {0}")]
    InvalidRoutingKey(String),
    #[error("VALIDATION_FAILED: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("DUPLICATE_API_KEY: {0}")]
    DuplicateApiKey(String),
    #[error("UNKNOWN_WIDGET_TYPE: {0}")]
    UnknownWidgetType(String),
    #[error("CASCADE_INCOMPLETE: metric {metric_id} on shard {shard_id}: {reason}")]
    CascadeIncomplete {
        metric_id: i64,
        shard_id: usize,
        reason: String,
    },
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub(crate) fn poisoned(what: &str) -> AppError {
    AppError::Internal(format!("{} mutex poisoned", what))
}
