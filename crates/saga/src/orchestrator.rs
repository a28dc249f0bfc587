//! Direct orchestration: one task drives one saga to a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use common::{SagaId, SagaStatus};
use futures_util::future::join_all;
use saga_store::{Created, SagaStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::definition::{DefinitionSet, SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError};
use crate::instance::{SagaInstance, SagaOutcome};
use crate::invoker::{Phase, StepContext, StepError, StepInvoker};
use crate::machine::{self, NextAction};
use crate::payload::Payload;
use crate::registry::{InvokerRegistry, SagaDefinitionSpec};
use crate::retry::{RetryDecision, RetryPolicy};

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    /// An in-process driver was signalled and will unwind on its own.
    Signalled,
    /// No driver was active, so the request drove the saga to an outcome.
    Finished(SagaOutcome),
    /// The saga is already unwinding.
    AlreadyCompensating,
    /// The saga had already finished.
    AlreadyTerminal(SagaOutcome),
}

type ActiveDrivers = Arc<Mutex<HashMap<SagaId, watch::Sender<bool>>>>;

/// Drives saga instances through their definitions.
///
/// Every transition is persisted before the next action, so any instance
/// left behind by a crash can be picked up with [`resume`](Self::resume)
/// or [`recover`](Self::recover). Within one process at most one driver
/// runs per instance; across processes the store's optimistic versioning
/// makes the slower driver back off.
#[derive(Clone)]
pub struct SagaOrchestrator<S> {
    store: S,
    definitions: Arc<RwLock<DefinitionSet>>,
    default_policy: Arc<dyn RetryPolicy>,
    step_timeout: Duration,
    active: ActiveDrivers,
}

impl<S> SagaOrchestrator<S>
where
    S: SagaStore + Clone + 'static,
{
    /// Creates an orchestrator with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, &OrchestratorConfig::default())
    }

    pub fn with_config(store: S, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            definitions: Arc::default(),
            default_policy: Arc::new(config.retry_policy()),
            step_timeout: config.step_timeout,
            active: Arc::default(),
        }
    }

    /// Replaces the policy used by steps that do not set their own.
    pub fn with_default_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register(&self, definition: SagaDefinition) -> Result<()> {
        write(&self.definitions).register(definition)
    }

    /// Resolves a serialized definition against `registry` and registers it.
    pub fn register_spec(&self, spec: &SagaDefinitionSpec, registry: &InvokerRegistry) -> Result<()> {
        self.register(registry.resolve(spec)?)
    }

    /// Runs a saga to a terminal state.
    ///
    /// Re-executing an id that already finished returns the stored outcome
    /// without invoking any step. An id already used with a different
    /// definition or payload fails with `IdempotencyConflict`.
    #[tracing::instrument(skip_all, fields(saga_id = %id, definition = definition_name))]
    pub async fn execute(
        &self,
        id: SagaId,
        definition_name: &str,
        payload: Payload,
    ) -> Result<SagaOutcome> {
        let definition = self.definition(definition_name)?;
        let instance = self.create_or_load(id, &definition, payload).await?;
        if instance.status().is_terminal() {
            tracing::info!(status = %instance.status(), "saga already finished");
            return Ok(instance.outcome());
        }
        self.run(id, definition).await
    }

    /// Runs a saga under a freshly generated id.
    pub async fn execute_new(&self, definition_name: &str, payload: Payload) -> Result<SagaOutcome> {
        self.execute(SagaId::new(), definition_name, payload).await
    }

    /// Persists the instance, then drives it on a background task.
    ///
    /// The instance is visible to [`get_status`](Self::get_status) as soon
    /// as this returns.
    pub async fn submit(
        &self,
        id: SagaId,
        definition_name: &str,
        payload: Payload,
    ) -> Result<JoinHandle<Result<SagaOutcome>>> {
        let definition = self.definition(definition_name)?;
        let instance = self.create_or_load(id, &definition, payload).await?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            if instance.status().is_terminal() {
                return Ok(instance.outcome());
            }
            this.run(id, definition).await
        }))
    }

    /// Returns a read-only snapshot of the instance.
    pub async fn get_status(&self, id: SagaId) -> Result<SagaInstance> {
        self.load_instance(id).await
    }

    /// Continues a persisted instance from where it stopped.
    #[tracing::instrument(skip_all, fields(saga_id = %id))]
    pub async fn resume(&self, id: SagaId) -> Result<SagaOutcome> {
        let instance = self.load_instance(id).await?;
        if instance.status().is_terminal() {
            return Ok(instance.outcome());
        }
        let definition = self.definition(instance.definition_name())?;
        tracing::info!(
            status = %instance.status(),
            step = instance.current_step(),
            "resuming saga"
        );
        self.run(id, definition).await
    }

    /// Requests that a saga stop moving forward and unwind.
    ///
    /// Completed steps are compensated as for any other failure. A saga
    /// that is already compensating or finished is left alone.
    #[tracing::instrument(skip_all, fields(saga_id = %id))]
    pub async fn cancel(&self, id: SagaId) -> Result<Cancellation> {
        let instance = self.load_instance(id).await?;
        match instance.status() {
            status if status.is_terminal() => {
                return Ok(Cancellation::AlreadyTerminal(instance.outcome()));
            }
            SagaStatus::Compensating => return Ok(Cancellation::AlreadyCompensating),
            _ => {}
        }

        let definition = self.definition(instance.definition_name())?;
        match self.claim(id, true) {
            Some(claim) => {
                tracing::info!("no active driver, unwinding in place");
                let outcome = self.run_claimed(claim, id, definition).await?;
                Ok(Cancellation::Finished(outcome))
            }
            None => {
                self.signal(id);
                tracing::info!("signalled active driver");
                Ok(Cancellation::Signalled)
            }
        }
    }

    /// Resumes every persisted instance that has not finished.
    ///
    /// Instances are driven concurrently. Each result is reported next to
    /// its id so one failing saga does not hide the others.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<(SagaId, Result<SagaOutcome>)>> {
        let mut ids = Vec::new();
        for status in [SagaStatus::Pending, SagaStatus::Running, SagaStatus::Compensating] {
            ids.extend(self.store.list_by_status(status).await?.into_iter().map(|r| r.id));
        }
        tracing::info!(count = ids.len(), "recovering unfinished sagas");

        let results = join_all(ids.iter().map(|&id| self.resume(id))).await;
        Ok(ids.into_iter().zip(results).collect())
    }

    // -- driving --

    async fn run(&self, id: SagaId, definition: Arc<SagaDefinition>) -> Result<SagaOutcome> {
        let claim = self.claim(id, false).ok_or(SagaError::OwnershipLost(id))?;
        self.run_claimed(claim, id, definition).await
    }

    /// Drives the instance under a held claim.
    ///
    /// The instance is read only once the claim is held, since a driver
    /// that released it just before may have advanced the saga.
    async fn run_claimed(
        &self,
        (guard, cancel): (ActiveGuard, watch::Receiver<bool>),
        id: SagaId,
        definition: Arc<SagaDefinition>,
    ) -> Result<SagaOutcome> {
        let instance = self.load_instance(id).await?;
        if instance.status().is_terminal() {
            tracing::info!(saga_id = %id, status = %instance.status(), "saga finished by another driver");
            return Ok(instance.outcome());
        }
        let started = Instant::now();
        let result = self.drive(instance, &definition, cancel).await;
        drop(guard);

        match result {
            Ok(outcome) => {
                record_outcome(&outcome, started);
                Ok(outcome)
            }
            Err(SagaError::OwnershipLost(id)) => self.outcome_after_lost_race(id).await,
            Err(e) => {
                tracing::warn!(saga_id = %id, error = %e, "saga driver stopped");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        mut instance: SagaInstance,
        definition: &SagaDefinition,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SagaOutcome> {
        loop {
            let retry_after = match machine::next_action(&instance, definition) {
                NextAction::Terminal => return Ok(instance.outcome()),
                NextAction::Start => {
                    instance.start(definition.len())?;
                    tracing::info!(saga_id = %instance.id(), "saga started");
                    None
                }
                NextAction::Forward(index) => {
                    let step = step_at(definition, index)?;
                    let cancel_requested = *cancel.borrow();
                    if cancel_requested {
                        tracing::warn!(saga_id = %instance.id(), step = step.name(), "saga cancelled, compensating");
                        instance.record_forward_failure(
                            index,
                            step.name(),
                            StepError::cancelled(),
                            RetryDecision::GiveUp,
                        )?;
                        None
                    } else {
                        self.attempt_forward(&mut instance, step, index, &mut cancel)
                            .await?
                            .map(|delay| (delay, Phase::Forward))
                    }
                }
                NextAction::Compensate(index) => {
                    let step = step_at(definition, index)?;
                    self.attempt_compensation(&mut instance, step, index)
                        .await?
                        .map(|delay| (delay, Phase::Compensate))
                }
                NextAction::SkipCompensation(index) => {
                    let step = step_at(definition, index)?;
                    tracing::info!(saga_id = %instance.id(), step = step.name(), "step has no compensation, skipping");
                    instance.record_compensation_skipped(index, step.name())?;
                    None
                }
                NextAction::Complete => {
                    instance.complete(definition.len())?;
                    None
                }
                NextAction::FinishCompensation => {
                    instance.finish_compensation()?;
                    None
                }
            };

            persist(&self.store, &mut instance).await?;

            match retry_after {
                Some((delay, Phase::Forward)) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancelled(&mut cancel) => {}
                    }
                }
                Some((delay, Phase::Compensate)) => tokio::time::sleep(delay).await,
                None => {}
            }
        }
    }

    /// Returns the delay before the next attempt, if one is due.
    async fn attempt_forward(
        &self,
        instance: &mut SagaInstance,
        step: &StepDefinition,
        index: usize,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<Duration>> {
        let ctx = instance.context(index, Phase::Forward, step.name());
        let timeout = step.timeout().unwrap_or(self.step_timeout);
        tracing::info!(saga_id = %ctx.saga_id(), step = step.name(), token = %ctx.token, "saga step started");

        let result = tokio::select! {
            result = invoke(step.forward().as_ref(), &ctx, instance.payload(), timeout) => result,
            () = cancelled(cancel) => Err(StepError::cancelled()),
        };

        match result {
            Ok(patch) => {
                instance.record_forward_success(index, step.name(), patch)?;
                Ok(None)
            }
            Err(error) => {
                let attempt = instance.attempts(index, Phase::Forward) + 1;
                let decision =
                    machine::decide(step, index, attempt, &error, self.default_policy.as_ref());
                instance.record_forward_failure(index, step.name(), error.clone(), decision)?;
                Ok(log_failure(&ctx, attempt, &error, decision))
            }
        }
    }

    async fn attempt_compensation(
        &self,
        instance: &mut SagaInstance,
        step: &StepDefinition,
        index: usize,
    ) -> Result<Option<Duration>> {
        let Some(invoker) = step.compensation() else {
            instance.record_compensation_skipped(index, step.name())?;
            return Ok(None);
        };
        let ctx = instance.context(index, Phase::Compensate, step.name());
        let input = instance.compensation_input(index)?;
        let timeout = step.timeout().unwrap_or(self.step_timeout);
        tracing::info!(saga_id = %ctx.saga_id(), step = step.name(), token = %ctx.token, "compensating step");

        match invoke(invoker.as_ref(), &ctx, &input, timeout).await {
            Ok(patch) => {
                instance.record_compensation_success(index, step.name(), patch)?;
                Ok(None)
            }
            Err(error) => {
                let attempt = instance.attempts(index, Phase::Compensate) + 1;
                let decision =
                    machine::decide(step, index, attempt, &error, self.default_policy.as_ref());
                instance.record_compensation_failure(index, step.name(), error.clone(), decision)?;
                Ok(log_failure(&ctx, attempt, &error, decision))
            }
        }
    }

    /// Another driver advanced the instance. Its result stands if it
    /// already finished; otherwise the saga is left to it.
    async fn outcome_after_lost_race(&self, id: SagaId) -> Result<SagaOutcome> {
        let instance = self.load_instance(id).await?;
        if instance.status().is_terminal() {
            tracing::info!(saga_id = %id, status = %instance.status(), "lost version race to a finished driver");
            return Ok(instance.outcome());
        }
        tracing::warn!(saga_id = %id, status = %instance.status(), "lost version race, abandoning saga");
        Err(SagaError::OwnershipLost(id))
    }

    // -- bookkeeping --

    fn definition(&self, name: &str) -> Result<Arc<SagaDefinition>> {
        read(&self.definitions).get(name)
    }

    async fn create_or_load(
        &self,
        id: SagaId,
        definition: &SagaDefinition,
        payload: Payload,
    ) -> Result<SagaInstance> {
        let mut instance = SagaInstance::new(id, definition.name(), payload);
        match self.store.create(instance.to_record()?).await {
            Ok(Created::Inserted) => {
                instance.set_version(Created::Inserted.version());
                metrics::counter!("saga_executions_total").increment(1);
                Ok(instance)
            }
            Ok(Created::Existing(_)) => self.load_instance(id).await,
            Err(StoreError::AlreadyExists(id)) => Err(SagaError::IdempotencyConflict(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_instance(&self, id: SagaId) -> Result<SagaInstance> {
        match self.store.load(id).await {
            Ok(record) => SagaInstance::from_record(record),
            Err(StoreError::NotFound(id)) => Err(SagaError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Registers this task as the instance's only in-process driver.
    fn claim(&self, id: SagaId, cancelled: bool) -> Option<(ActiveGuard, watch::Receiver<bool>)> {
        let mut active = lock(&self.active);
        if active.contains_key(&id) {
            return None;
        }
        let (tx, rx) = watch::channel(cancelled);
        active.insert(id, tx);
        Some((
            ActiveGuard {
                active: Arc::clone(&self.active),
                id,
            },
            rx,
        ))
    }

    fn signal(&self, id: SagaId) -> bool {
        match lock(&self.active).get(&id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

/// Unregisters a driver when it stops, however it stops.
struct ActiveGuard {
    active: ActiveDrivers,
    id: SagaId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
    }
}

/// Saves the instance and adopts the new version.
///
/// A version conflict means another driver got there first and is
/// reported as `OwnershipLost`.
pub(crate) async fn persist<S>(store: &S, instance: &mut SagaInstance) -> Result<()>
where
    S: SagaStore + ?Sized,
{
    match store.save(instance.to_record()?).await {
        Ok(version) => {
            instance.set_version(version);
            Ok(())
        }
        Err(StoreError::ConcurrencyConflict { id, .. }) => Err(SagaError::OwnershipLost(id)),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn step_at(definition: &SagaDefinition, index: usize) -> Result<&StepDefinition> {
    definition
        .step(index)
        .ok_or_else(|| SagaError::InvalidDefinition {
            name: definition.name().to_string(),
            reason: format!("no step at index {index}"),
        })
}

async fn invoke(
    invoker: &dyn StepInvoker,
    ctx: &StepContext,
    payload: &Payload,
    timeout: Duration,
) -> std::result::Result<Payload, StepError> {
    let call = async {
        match ctx.phase() {
            Phase::Forward => invoker.forward(ctx, payload).await,
            Phase::Compensate => invoker.compensate(ctx, payload).await,
        }
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StepError::timeout(timeout)),
    }
}

/// Resolves once the channel reads true. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_failure(
    ctx: &StepContext,
    attempt: u32,
    error: &StepError,
    decision: RetryDecision,
) -> Option<Duration> {
    match decision {
        RetryDecision::Retry(delay) => {
            metrics::counter!("saga_step_retries_total").increment(1);
            tracing::warn!(
                saga_id = %ctx.saga_id(),
                step = %ctx.step_name,
                phase = %ctx.phase(),
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "step attempt failed, retrying"
            );
            Some(delay)
        }
        RetryDecision::GiveUp => {
            tracing::warn!(
                saga_id = %ctx.saga_id(),
                step = %ctx.step_name,
                phase = %ctx.phase(),
                attempt,
                error = %error,
                "step failed, giving up"
            );
            None
        }
    }
}

fn record_outcome(outcome: &SagaOutcome, started: Instant) {
    let duration = started.elapsed().as_secs_f64();
    metrics::histogram!("saga_duration_seconds").record(duration);
    match outcome.status {
        SagaStatus::Completed => {
            metrics::counter!("saga_completed").increment(1);
            tracing::info!(saga_id = %outcome.saga_id, duration, "saga completed successfully");
        }
        SagaStatus::Compensated => {
            metrics::counter!("saga_compensated").increment(1);
            tracing::info!(saga_id = %outcome.saga_id, duration, "saga compensated");
        }
        SagaStatus::Failed => {
            metrics::counter!("saga_failed").increment(1);
            tracing::warn!(
                saga_id = %outcome.saga_id,
                pending = ?outcome.pending_compensation,
                "saga failed with compensation incomplete"
            );
        }
        _ => {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read(lock: &RwLock<DefinitionSet>) -> std::sync::RwLockReadGuard<'_, DefinitionSet> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<DefinitionSet>) -> std::sync::RwLockWriteGuard<'_, DefinitionSet> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
