//! Saga orchestration with compensating actions.
//!
//! A saga is an ordered list of steps, each with a forward action and
//! optionally a compensating action. The orchestrator runs the forward
//! actions in order. If one fails for good, the steps that already
//! succeeded are undone in reverse order.
//!
//! Progress is persisted through a [`saga_store::SagaStore`] after every
//! transition, so a saga interrupted by a crash continues from where it
//! stopped and never repeats a completed forward step.
//!
//! Two drivers share one state machine:
//! - [`SagaOrchestrator`] calls [`StepInvoker`]s directly and blocks each
//!   saga on its own task.
//! - [`EventDrivenCoordinator`] emits step commands for an external bus
//!   and advances as step results come back.

pub mod choreography;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod instance;
pub mod invoker;
pub mod machine;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod retry;
pub mod testing;

pub use choreography::{Dispatch, EventDrivenCoordinator, StepCommand, StepResultEvent};
pub use common::{SagaId, SagaStatus};
pub use config::OrchestratorConfig;
pub use definition::{DefinitionSet, SagaDefinition, SagaDefinitionBuilder, StepDefinition};
pub use error::{Result, SagaError};
pub use events::{HistoryEntry, SagaEvent};
pub use instance::{SagaInstance, SagaOutcome, StepFailure};
pub use invoker::{IdempotencyToken, Phase, StepContext, StepError, StepErrorKind, StepInvoker};
pub use orchestrator::{Cancellation, SagaOrchestrator};
pub use payload::{FieldConflict, Payload};
pub use registry::{InvokerRegistry, SagaDefinitionSpec, StepSpec};
pub use retry::{
    CodeClassifier, ErrorClass, ErrorClassifier, ExponentialBackoff, KindClassifier, NoRetry,
    RetryDecision, RetryPolicy,
};
