use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("invalid payload for category {category}: {reason}")]
    InvalidPayload { category: String, reason: String },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
