//! Crate-boundary error types for Courier infrastructure calls.
//!
//! This is distinct from [`crate::contracts::HandlerError`]: `CourierError` is what
//! `ChannelResolver`, `StatusEngine`, `Spooler` and friends return to their callers.
//! It never crosses the `Handler::send` boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CourierError>;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue store error: {0}")]
    Queue(String),

    #[error("Event store error: {0}")]
    EventStore(String),

    #[error("Media cache error: {0}")]
    Media(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Wrong channel type: expected {expected}, got {actual}")]
    WrongChannelType { expected: String, actual: String },

    #[error("Channel cache entry expired")]
    Expired,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl CourierError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Usage(_) => 400,
            Self::NotFound(_) => 404,
            Self::WrongChannelType { .. } | Self::Expired => 409,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::EventStore(_) => "EVENT_STORE_ERROR",
            Self::Media(_) => "MEDIA_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::WrongChannelType { .. } => "WRONG_CHANNEL_TYPE",
            Self::Expired => "EXPIRED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Usage(_) => "USAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Internal(err.to_string())
    }
}
