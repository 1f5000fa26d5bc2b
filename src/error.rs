//! Error types for the listener container.

use crate::container::SubscriptionId;
use thiserror::Error;

/// Main error type for container and source operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cannot convert document to {type_name}: {message}")]
    Conversion {
        type_name: &'static str,
        message: String,
    },

    #[error("Source connection error: {0}")]
    SourceConnection(String),

    #[error("Shutdown timed out waiting for subscriptions {subscriptions:?}")]
    ShutdownTimeout { subscriptions: Vec<SubscriptionId> },

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for ContainerError {
    fn from(e: serde_json::Error) -> Self {
        ContainerError::Serialization(e.to_string())
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
