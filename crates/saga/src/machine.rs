//! The saga state machine, shared by both drivers.
//!
//! Nothing here performs I/O. A driver asks [`next_action`] what to do,
//! performs it, feeds the result back into the instance and persists.

use common::SagaStatus;

use crate::definition::{SagaDefinition, StepDefinition};
use crate::instance::SagaInstance;
use crate::invoker::StepError;
use crate::retry::{RetryDecision, RetryPolicy};

/// What a driver must do next to move an instance toward a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Move from `Pending` to `Running`.
    Start,
    /// Invoke the forward action of this step.
    Forward(usize),
    /// Invoke the compensating action of this completed step.
    Compensate(usize),
    /// This completed step has no compensation; record the skip.
    SkipCompensation(usize),
    /// Every forward step succeeded.
    Complete,
    /// Every completed step has been unwound.
    FinishCompensation,
    /// Nothing left to do.
    Terminal,
}

pub fn next_action(instance: &SagaInstance, definition: &SagaDefinition) -> NextAction {
    match instance.status() {
        SagaStatus::Pending => NextAction::Start,
        SagaStatus::Running => {
            if instance.current_step() < definition.len() {
                NextAction::Forward(instance.current_step())
            } else {
                NextAction::Complete
            }
        }
        SagaStatus::Compensating => match instance.pending_compensation().last() {
            Some(&index) => match definition.step(index) {
                Some(step) if step.is_compensable() => NextAction::Compensate(index),
                _ => NextAction::SkipCompensation(index),
            },
            None => NextAction::FinishCompensation,
        },
        SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => {
            NextAction::Terminal
        }
    }
}

/// Decides whether a failed attempt is retried.
///
/// `attempt` counts failures of this step in this phase, including the one
/// being decided. Cancellation gives up regardless of policy.
pub fn decide(
    step: &StepDefinition,
    index: usize,
    attempt: u32,
    error: &StepError,
    default_policy: &dyn RetryPolicy,
) -> RetryDecision {
    if error.is_cancellation() {
        return RetryDecision::GiveUp;
    }
    match step.retry_policy() {
        Some(policy) => policy.decide(index, attempt, error),
        None => default_policy.decide(index, attempt, error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use common::SagaId;

    use super::*;
    use crate::payload::Payload;
    use crate::retry::{ExponentialBackoff, NoRetry};
    use crate::testing::{CallLog, RecordingInvoker};

    fn definition() -> SagaDefinition {
        let log = CallLog::new();
        SagaDefinition::builder("Checkout")
            .step(StepDefinition::new("reserve", Arc::new(RecordingInvoker::new(&log))))
            .step(StepDefinition::irreversible("notify", Arc::new(RecordingInvoker::new(&log))))
            .step(StepDefinition::new("charge", Arc::new(RecordingInvoker::new(&log))))
            .build()
            .unwrap()
    }

    #[test]
    fn walks_forward_then_completes() {
        let def = definition();
        let mut saga = SagaInstance::new(SagaId::new(), "Checkout", Payload::new());
        assert_eq!(next_action(&saga, &def), NextAction::Start);

        saga.start(def.len()).unwrap();
        for index in 0..def.len() {
            assert_eq!(next_action(&saga, &def), NextAction::Forward(index));
            saga.record_forward_success(index, "step", Payload::new()).unwrap();
        }
        assert_eq!(next_action(&saga, &def), NextAction::Complete);

        saga.complete(def.len()).unwrap();
        assert_eq!(next_action(&saga, &def), NextAction::Terminal);
    }

    #[test]
    fn unwinds_in_reverse_and_skips_irreversible_steps() {
        let def = definition();
        let mut saga = SagaInstance::new(SagaId::new(), "Checkout", Payload::new());
        saga.start(def.len()).unwrap();
        saga.record_forward_success(0, "reserve", Payload::new()).unwrap();
        saga.record_forward_success(1, "notify", Payload::new()).unwrap();
        saga.record_forward_failure(2, "charge", StepError::permanent("declined"), RetryDecision::GiveUp)
            .unwrap();

        assert_eq!(next_action(&saga, &def), NextAction::SkipCompensation(1));
        saga.record_compensation_skipped(1, "notify").unwrap();
        assert_eq!(next_action(&saga, &def), NextAction::Compensate(0));
        saga.record_compensation_success(0, "reserve", Payload::new()).unwrap();
        assert_eq!(next_action(&saga, &def), NextAction::FinishCompensation);
    }

    #[test]
    fn cancellation_overrides_retry_policy() {
        let def = definition();
        let policy = ExponentialBackoff::new();
        let step = def.step(0).unwrap();

        assert_eq!(
            decide(step, 0, 1, &StepError::cancelled(), &policy),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            decide(step, 0, 1, &StepError::transient("busy"), &policy),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn step_policy_takes_precedence_over_default() {
        let log = CallLog::new();
        let step = StepDefinition::new("reserve", Arc::new(RecordingInvoker::new(&log)))
            .with_retry(Arc::new(NoRetry));
        let default = ExponentialBackoff::new().with_base_delay(Duration::from_millis(1));

        assert_eq!(
            decide(&step, 0, 1, &StepError::transient("busy"), &default),
            RetryDecision::GiveUp
        );
    }
}
