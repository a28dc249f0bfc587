//! The capability boundary between the orchestrator and external services.

use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Payload;

/// Which half of a step is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The "do" action.
    Forward,
    /// The "undo" action.
    Compensate,
}

impl Phase {
    /// Returns the phase name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Forward => "forward",
            Phase::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable key for one logical attempt of a step.
///
/// The epoch is the number of persisted failures for the step and phase
/// whose outcome is known. A timed-out call is not one of them, so its
/// retries carry the same token, and a driver resuming after a crash
/// produces the token of the attempt that was in flight. External services
/// are expected to deduplicate on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyToken {
    pub saga_id: SagaId,
    pub step_index: usize,
    pub phase: Phase,
    pub attempt_epoch: u32,
}

impl std::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.saga_id, self.step_index, self.phase, self.attempt_epoch
        )
    }
}

/// Everything an invoker knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub token: IdempotencyToken,
    pub definition_name: String,
    pub step_name: String,
}

impl StepContext {
    /// Returns the saga instance ID.
    pub fn saga_id(&self) -> SagaId {
        self.token.saga_id
    }

    /// Returns the index of the step within its definition.
    pub fn step_index(&self) -> usize {
        self.token.step_index
    }

    /// Returns the phase being invoked.
    pub fn phase(&self) -> Phase {
        self.token.phase
    }
}

/// Broad category of a step failure, used by retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Temporary unavailability; may succeed on retry.
    Transient,
    /// The call did not answer within its bounded wait. Outcome unknown.
    Timeout,
    /// Validation or business-rule rejection; will not succeed on retry.
    Permanent,
    /// The saga was cancelled while the step was pending.
    Cancelled,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepErrorKind::Transient => "transient",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::Permanent => "permanent",
            StepErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failure reported by a step invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} failure: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    /// Service-specific error code, for classifiers that key on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StepError {
    /// Creates an error of the given kind.
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// A retriable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Transient, message)
    }

    /// A non-retriable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Permanent, message)
    }

    /// The call exceeded `after`.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            StepErrorKind::Timeout,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    /// The saga was cancelled.
    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "saga cancelled")
    }

    /// Attaches a service-specific error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Returns true if this error is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.kind == StepErrorKind::Cancelled
    }
}

/// A call into an external service on behalf of one saga step.
///
/// Both operations may be invoked more than once for the same
/// [`IdempotencyToken`] (a retry after a timeout, or a resume after a crash),
/// so the service behind an implementation must deduplicate on
/// `ctx.token`. Compensations must be idempotent.
///
/// The returned payload is a patch merged into the saga's context.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Performs the step's action.
    async fn forward(&self, ctx: &StepContext, payload: &Payload) -> Result<Payload, StepError>;

    /// Undoes the step's action, given the payload as it stood right after
    /// the forward action succeeded.
    async fn compensate(&self, ctx: &StepContext, payload: &Payload) -> Result<Payload, StepError> {
        let _ = payload;
        Err(StepError::permanent(format!(
            "step '{}' has no compensating action",
            ctx.step_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_display_is_stable() {
        let saga_id = SagaId::new();
        let token = IdempotencyToken {
            saga_id,
            step_index: 2,
            phase: Phase::Compensate,
            attempt_epoch: 1,
        };
        assert_eq!(token.to_string(), format!("{saga_id}:2:compensate:1"));
    }

    #[test]
    fn step_error_serialization_omits_missing_code() {
        let json = serde_json::to_value(StepError::transient("busy")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "transient", "message": "busy"})
        );

        let coded = StepError::permanent("declined").with_code("card_declined");
        let back: StepError =
            serde_json::from_value(serde_json::to_value(&coded).unwrap()).unwrap();
        assert_eq!(back, coded);
    }

    #[test]
    fn step_error_display() {
        assert_eq!(
            StepError::timeout(Duration::from_millis(250)).to_string(),
            "timeout failure: no response after 250ms"
        );
        assert!(StepError::cancelled().is_cancellation());
    }
}
