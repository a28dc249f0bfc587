use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A different saga submission already owns this id.
    #[error("Saga {0} already exists with a different definition or initial payload")]
    AlreadyExists(SagaId),

    /// No record exists for the id.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The stored version did not match the version the caller read.
    #[error("Concurrency conflict for saga {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A stored status column could not be parsed.
    #[error("Corrupt record for saga {id}: {reason}")]
    Corrupt { id: SagaId, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
