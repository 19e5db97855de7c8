use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with a saga state store.
///
/// A lost compare-and-swap is not an error: [`crate::SagaStateStore::try_update`]
/// reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// A saga with this ID has already been created.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The state handed to `try_update` does not carry the successor of the
    /// expected version.
    #[error("Invalid version for saga {saga_id}: expected {expected}, found {actual}")]
    InvalidVersion {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The state is structurally inconsistent and was rejected before writing.
    #[error("Invalid saga state: {0}")]
    Validation(String),

    /// A persisted status column held an unknown value.
    #[error("Unknown status value: {0}")]
    InvalidStatus(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
