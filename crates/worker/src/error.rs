//! Worker error types.

use saga::{ConfigError, SagaError};
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur while running the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Orchestrator error.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// State store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// The trigger dispatcher is no longer receiving.
    #[error("Trigger channel closed")]
    ChannelClosed,
}

/// Convenience type alias for worker results.
pub type Result<T> = std::result::Result<T, WorkerError>;
