//! Error types for client operations.

use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations.
///
/// Errors detected before a network stream is established are returned
/// synchronously. Errors after that point reach the subscription's
/// [`MessageHandler::on_error`](crate::MessageHandler::on_error) exactly once.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No such stream: {0}")]
    NoSuchStream(String),

    #[error("No such partition: {stream}/{partition}")]
    NoSuchPartition { stream: String, partition: u32 },

    #[error("Stream already exists: {0}")]
    StreamExists(String),

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Offset {requested} is out of range: {reason}")]
    OffsetOutOfRange { requested: u64, reason: String },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Client is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// True for the "stream or partition does not exist" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::NoSuchStream(_) | ClientError::NoSuchPartition { .. }
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ClientError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ClientError::DecodeFailure(format!("envelope encode: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for ClientError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ClientError::DecodeFailure(e.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
