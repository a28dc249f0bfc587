//! Saga error types.

use common::{SagaId, SagaStatus};
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// Step failures are not errors at this level: they are retried or
/// compensated and end up in the saga's outcome. These variants cover
/// configuration mistakes, bookkeeping violations and storage problems.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered under this name.
    #[error("Saga definition not found: {0}")]
    DefinitionNotFound(String),

    /// A definition with this name is already registered.
    #[error("Saga definition already registered: {0}")]
    DuplicateDefinition(String),

    /// The definition violates a structural rule.
    #[error("Invalid saga definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// A definition spec names an invoker the registry does not know.
    #[error("Step '{step}' of '{definition}' references unknown invoker '{invoker}'")]
    UnknownInvoker {
        definition: String,
        step: String,
        invoker: String,
    },

    /// No saga instance exists with this id.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The id is already used by a different submission.
    #[error("Saga {0} was already submitted with a different definition or payload")]
    IdempotencyConflict(SagaId),

    /// The instance is not in a state that permits the requested change.
    #[error("Saga {saga_id} in state {status}: {reason}")]
    InvalidState {
        saga_id: SagaId,
        status: SagaStatus,
        reason: String,
    },

    /// Another driver advanced the instance first.
    #[error("Saga {0} is owned by another driver")]
    OwnershipLost(SagaId),

    /// A payload was not a JSON object.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
