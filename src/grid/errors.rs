//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Venue error: {0}")]
    Venue(String),

    #[error("Venue rejected request permanently: {0}")]
    VenueFatal(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Account cleanup incomplete: {0}")]
    CleanupFailed(String),

    #[error("Operation not supported by this venue: {0}")]
    Unsupported(&'static str),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Whether a retry on a later tick can reasonably succeed. Anything
    /// else (auth failure, unknown instrument, bad configuration) warrants
    /// an immediate shutdown rather than a retry burn.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Venue(_)
                | GridError::WebSocket(_)
                | GridError::ChannelSend(_)
                | GridError::JsonParse(_)
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
