//! Event-driven coordination over an external message bus.
//!
//! [`EventDrivenCoordinator`] never calls a step itself. Each method
//! returns a [`Dispatch`] telling the embedding bus what to deliver next,
//! and step results come back in as [`StepResultEvent`]s. It drives the
//! same state machine as [`SagaOrchestrator`](crate::SagaOrchestrator)
//! and persists after every transition.

use std::sync::Arc;
use std::time::Duration;

use common::{SagaId, SagaStatus};
use saga_store::{Created, SagaStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::definition::{DefinitionSet, SagaDefinition};
use crate::error::{Result, SagaError};
use crate::instance::{SagaInstance, SagaOutcome};
use crate::invoker::{IdempotencyToken, Phase, StepError};
use crate::machine::{self, NextAction};
use crate::orchestrator::{persist, step_at};
use crate::payload::Payload;
use crate::retry::{RetryDecision, RetryPolicy};

/// A request for the bus to invoke one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    /// Echo this back in the [`StepResultEvent`].
    pub token: IdempotencyToken,
    pub definition_name: String,
    pub step_name: String,
    pub payload: Payload,
    /// Wait this long before delivering, for retries.
    pub delay: Option<Duration>,
    /// Report a [`StepError::timeout`] if the step takes longer than this.
    pub timeout: Duration,
}

/// The outcome of one step invocation, reported by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultEvent {
    pub token: IdempotencyToken,
    pub result: std::result::Result<Payload, StepError>,
}

/// What the bus should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Invoke(StepCommand),
    Finished(SagaOutcome),
    /// The event was stale or a duplicate and changed nothing.
    Ignored { reason: String },
}

/// Drives sagas from inbound step-result events.
pub struct EventDrivenCoordinator<S> {
    store: S,
    definitions: DefinitionSet,
    default_policy: Arc<dyn RetryPolicy>,
    step_timeout: Duration,
}

impl<S: SagaStore> EventDrivenCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, &OrchestratorConfig::default())
    }

    pub fn with_config(store: S, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            definitions: DefinitionSet::new(),
            default_policy: Arc::new(config.retry_policy()),
            step_timeout: config.step_timeout,
        }
    }

    pub fn with_default_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        self.definitions.register(definition)
    }

    /// Creates the instance and returns its first command.
    ///
    /// Re-submitting a finished saga returns its stored outcome.
    #[tracing::instrument(skip_all, fields(saga_id = %id, definition = definition_name))]
    pub async fn submit(&self, id: SagaId, definition_name: &str, payload: Payload) -> Result<Dispatch> {
        let definition = self.definitions.get(definition_name)?;
        let mut instance = SagaInstance::new(id, definition.name(), payload);
        let instance = match self.store.create(instance.to_record()?).await {
            Ok(Created::Inserted) => {
                instance.set_version(Created::Inserted.version());
                metrics::counter!("saga_executions_total").increment(1);
                instance
            }
            Ok(Created::Existing(_)) => self.load(id).await?,
            Err(StoreError::AlreadyExists(id)) => return Err(SagaError::IdempotencyConflict(id)),
            Err(e) => return Err(e.into()),
        };
        self.guarded(id, self.advance(instance, &definition, None)).await
    }

    /// Applies a step result and returns the next command.
    ///
    /// A result whose token does not match the step the saga is waiting on
    /// is ignored.
    #[tracing::instrument(skip_all, fields(saga_id = %event.token.saga_id, token = %event.token))]
    pub async fn handle(&self, event: StepResultEvent) -> Result<Dispatch> {
        let id = event.token.saga_id;
        let mut instance = self.load(id).await?;
        let definition = self.definitions.get(instance.definition_name())?;

        let (index, phase) = match machine::next_action(&instance, &definition) {
            NextAction::Forward(index) => (index, Phase::Forward),
            NextAction::Compensate(index) => (index, Phase::Compensate),
            _ => return Ok(ignored(&event.token, "saga is not waiting on a step")),
        };
        if event.token != instance.token(index, phase) {
            return Ok(ignored(&event.token, "token does not match the awaited step"));
        }

        let step = step_at(&definition, index)?;
        let delay = match (phase, event.result) {
            (Phase::Forward, Ok(patch)) => {
                instance.record_forward_success(index, step.name(), patch)?;
                None
            }
            (Phase::Compensate, Ok(patch)) => {
                instance.record_compensation_success(index, step.name(), patch)?;
                None
            }
            (phase, Err(error)) => {
                let attempt = instance.attempts(index, phase) + 1;
                let decision =
                    machine::decide(step, index, attempt, &error, self.default_policy.as_ref());
                tracing::warn!(step = step.name(), %phase, attempt, error = %error, "step attempt failed");
                match phase {
                    Phase::Forward => instance.record_forward_failure(index, step.name(), error, decision)?,
                    Phase::Compensate => {
                        instance.record_compensation_failure(index, step.name(), error, decision)?
                    }
                }
                match decision {
                    RetryDecision::Retry(delay) => {
                        metrics::counter!("saga_step_retries_total").increment(1);
                        Some(delay)
                    }
                    RetryDecision::GiveUp => None,
                }
            }
        };

        let work = async {
            persist(&self.store, &mut instance).await?;
            if instance.status() == SagaStatus::Failed {
                count_outcome(&instance.outcome());
            }
            self.advance(instance, &definition, delay).await
        };
        self.guarded(id, work).await
    }

    /// Stops a saga moving forward and starts its unwind.
    ///
    /// A forward result still in flight is ignored when it arrives, so its
    /// effects are not compensated.
    #[tracing::instrument(skip_all, fields(saga_id = %id))]
    pub async fn cancel(&self, id: SagaId) -> Result<Dispatch> {
        let mut instance = self.load(id).await?;
        let definition = self.definitions.get(instance.definition_name())?;

        match instance.status() {
            status if status.is_terminal() => return Ok(Dispatch::Finished(instance.outcome())),
            SagaStatus::Compensating => {
                return Ok(Dispatch::Ignored {
                    reason: "saga is already compensating".to_string(),
                });
            }
            SagaStatus::Pending => instance.start(definition.len())?,
            _ => {}
        }

        if let NextAction::Forward(index) = machine::next_action(&instance, &definition) {
            let step = step_at(&definition, index)?;
            tracing::warn!(step = step.name(), "saga cancelled, compensating");
            instance.record_forward_failure(
                index,
                step.name(),
                StepError::cancelled(),
                RetryDecision::GiveUp,
            )?;
        }

        let work = async {
            persist(&self.store, &mut instance).await?;
            self.advance(instance, &definition, None).await
        };
        self.guarded(id, work).await
    }

    /// Re-issues the command the saga is waiting on, for redelivery after
    /// a bus or process restart. The token is unchanged.
    pub async fn resend(&self, id: SagaId) -> Result<Dispatch> {
        let instance = self.load(id).await?;
        let definition = self.definitions.get(instance.definition_name())?;
        self.guarded(id, self.advance(instance, &definition, None)).await
    }

    /// Applies every transition that needs no step call, then returns the
    /// command for the next one or the outcome.
    async fn advance(
        &self,
        mut instance: SagaInstance,
        definition: &SagaDefinition,
        delay: Option<Duration>,
    ) -> Result<Dispatch> {
        loop {
            match machine::next_action(&instance, definition) {
                NextAction::Terminal => return Ok(Dispatch::Finished(instance.outcome())),
                NextAction::Forward(index) => {
                    let step = step_at(definition, index)?;
                    return Ok(Dispatch::Invoke(StepCommand {
                        token: instance.token(index, Phase::Forward),
                        definition_name: definition.name().to_string(),
                        step_name: step.name().to_string(),
                        payload: instance.payload().clone(),
                        delay,
                        timeout: step.timeout().unwrap_or(self.step_timeout),
                    }));
                }
                NextAction::Compensate(index) => {
                    let step = step_at(definition, index)?;
                    return Ok(Dispatch::Invoke(StepCommand {
                        token: instance.token(index, Phase::Compensate),
                        definition_name: definition.name().to_string(),
                        step_name: step.name().to_string(),
                        payload: instance.compensation_input(index)?,
                        delay,
                        timeout: step.timeout().unwrap_or(self.step_timeout),
                    }));
                }
                NextAction::Start => instance.start(definition.len())?,
                NextAction::SkipCompensation(index) => {
                    let step = step_at(definition, index)?;
                    instance.record_compensation_skipped(index, step.name())?;
                }
                NextAction::Complete => instance.complete(definition.len())?,
                NextAction::FinishCompensation => instance.finish_compensation()?,
            }
            persist(&self.store, &mut instance).await?;
            if instance.status().is_terminal() {
                count_outcome(&instance.outcome());
            }
        }
    }

    /// Turns a lost version race into the winner's result.
    async fn guarded<F>(&self, id: SagaId, work: F) -> Result<Dispatch>
    where
        F: std::future::Future<Output = Result<Dispatch>>,
    {
        match work.await {
            Err(SagaError::OwnershipLost(_)) => {
                let instance = self.load(id).await?;
                if instance.status().is_terminal() {
                    Ok(Dispatch::Finished(instance.outcome()))
                } else {
                    Ok(Dispatch::Ignored {
                        reason: "superseded by a concurrent update".to_string(),
                    })
                }
            }
            other => other,
        }
    }

    async fn load(&self, id: SagaId) -> Result<SagaInstance> {
        match self.store.load(id).await {
            Ok(record) => SagaInstance::from_record(record),
            Err(StoreError::NotFound(id)) => Err(SagaError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn ignored(token: &IdempotencyToken, reason: &str) -> Dispatch {
    tracing::debug!(%token, reason, "ignoring step result");
    Dispatch::Ignored {
        reason: reason.to_string(),
    }
}

fn count_outcome(outcome: &SagaOutcome) {
    let name = match outcome.status {
        SagaStatus::Completed => "saga_completed",
        SagaStatus::Compensated => "saga_compensated",
        SagaStatus::Failed => "saga_failed",
        _ => return,
    };
    metrics::counter!(name).increment(1);
    tracing::info!(saga_id = %outcome.saga_id, status = %outcome.status, "saga finished");
}

#[cfg(test)]
mod tests {
    use saga_store::InMemorySagaStore;
    use serde_json::json;

    use super::*;
    use crate::definition::StepDefinition;
    use crate::retry::NoRetry;
    use crate::testing::{CallLog, RecordingInvoker};

    fn coordinator() -> EventDrivenCoordinator<InMemorySagaStore> {
        let log = CallLog::new();
        let invoker = || Arc::new(RecordingInvoker::new(&log));
        let mut coordinator =
            EventDrivenCoordinator::new(InMemorySagaStore::new()).with_default_policy(Arc::new(NoRetry));
        coordinator
            .register(
                SagaDefinition::builder("Checkout")
                    .step(StepDefinition::new("reserve", invoker()))
                    .step(StepDefinition::new("charge", invoker()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        coordinator
    }

    fn command(dispatch: Dispatch) -> StepCommand {
        match dispatch {
            Dispatch::Invoke(command) => command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_emits_commands_in_order() {
        let coordinator = coordinator();
        let id = SagaId::new();

        let first = command(coordinator.submit(id, "Checkout", Payload::new()).await.unwrap());
        assert_eq!(first.step_name, "reserve");
        assert_eq!(first.token.phase, Phase::Forward);

        let second = command(
            coordinator
                .handle(StepResultEvent {
                    token: first.token,
                    result: Ok(Payload::new().with("reservation", "r-1")),
                })
                .await
                .unwrap(),
        );
        assert_eq!(second.step_name, "charge");
        assert_eq!(second.payload.get("reservation"), Some(&json!("r-1")));

        let done = coordinator
            .handle(StepResultEvent {
                token: second.token,
                result: Ok(Payload::new()),
            })
            .await
            .unwrap();
        match done {
            Dispatch::Finished(outcome) => assert!(outcome.is_completed()),
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_results_are_ignored() {
        let coordinator = coordinator();
        let first = command(
            coordinator
                .submit(SagaId::new(), "Checkout", Payload::new())
                .await
                .unwrap(),
        );
        let event = StepResultEvent {
            token: first.token,
            result: Ok(Payload::new()),
        };

        assert!(matches!(coordinator.handle(event.clone()).await.unwrap(), Dispatch::Invoke(_)));
        assert!(matches!(
            coordinator.handle(event).await.unwrap(),
            Dispatch::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn failure_emits_compensation_with_snapshot() {
        let coordinator = coordinator();
        let first = command(
            coordinator
                .submit(SagaId::new(), "Checkout", Payload::new())
                .await
                .unwrap(),
        );
        let second = command(
            coordinator
                .handle(StepResultEvent {
                    token: first.token,
                    result: Ok(Payload::new().with("reservation", "r-1")),
                })
                .await
                .unwrap(),
        );

        let undo = command(
            coordinator
                .handle(StepResultEvent {
                    token: second.token,
                    result: Err(StepError::permanent("declined")),
                })
                .await
                .unwrap(),
        );
        assert_eq!(undo.step_name, "reserve");
        assert_eq!(undo.token.phase, Phase::Compensate);
        assert_eq!(undo.payload.get("reservation"), Some(&json!("r-1")));

        match coordinator
            .handle(StepResultEvent {
                token: undo.token,
                result: Ok(Payload::new()),
            })
            .await
            .unwrap()
        {
            Dispatch::Finished(outcome) => {
                assert!(outcome.is_compensated());
                assert_eq!(outcome.error.unwrap().step_name, "charge");
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }
}
