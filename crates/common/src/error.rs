use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no burst control config found for operation type: {0}")]
    UnknownOperationType(String),

    #[error("no rate limit rule matches {method} {path}")]
    NoMatchingRule { path: String, method: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
