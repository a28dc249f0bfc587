//! Types shared by the saga store and the orchestrator.

pub mod status;
pub mod types;

pub use status::SagaStatus;
pub use types::SagaId;
