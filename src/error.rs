//! Error types for mailpacer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed enqueue request. Rejected before anything is persisted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The sender could not deliver the message. It stays pending.
    #[error("Delivery failed for message {message_id}: {reason}")]
    DeliveryFailed { message_id: String, reason: String },

    /// Delivered, but the claim lapsed before bookkeeping and another tick
    /// now owns the message.
    #[error("Claim on message {message_id} was lost after delivery")]
    ClaimLost { message_id: String },

    #[error("No handler registered under '{0}'")]
    HandlerResolutionFailed(String),

    #[error("Handler '{handler}' failed: {source:#}")]
    HandlerExecutionFailed {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn delivery(message_id: &str, reason: impl Into<String>) -> Self {
        Error::DeliveryFailed {
            message_id: message_id.to_string(),
            reason: reason.into(),
        }
    }
}
