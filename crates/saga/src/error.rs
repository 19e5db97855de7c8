//! Saga error types.

use common::SagaId;
use saga_store::{SagaStatus, SagaStoreError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during saga operations.
///
/// Step failures are not errors at this level: they are recorded on the saga
/// and drive retries or compensation. What surfaces here is what the caller
/// (usually a trigger) has to act on.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga is stored under this ID.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid state for saga {saga_id}: expected {expected}, actual {actual}")]
    InvalidState {
        saga_id: SagaId,
        expected: String,
        actual: SagaStatus,
    },

    /// A persisted or requested step name has no registered implementation.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A step with this name is already registered.
    #[error("Step already registered: {0}")]
    DuplicateStep(String),

    /// A saga definition without steps was started.
    #[error("Saga definition '{0}' has no steps")]
    EmptyDefinition(String),

    /// State store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
