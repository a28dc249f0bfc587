//! The mutable unit of work: one running saga.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{SagaId, SagaStatus};
use saga_store::{SagaRecord, Version};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::events::{
    AttemptFailedData, CompensationStartedData, HistoryEntry, SagaEvent, SagaFailedData,
    SagaStartedData, StepData, StepSucceededData,
};
use crate::invoker::{IdempotencyToken, Phase, StepContext, StepError, StepErrorKind};
use crate::payload::Payload;
use crate::retry::RetryDecision;

/// A failure attributed to a specific step and phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_index: usize,
    pub step_name: String,
    pub phase: Phase,
    pub error: StepError,
}

/// What a caller learns when a saga reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaOutcome {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    /// Final accumulated payload.
    pub payload: Payload,
    /// For `Compensated`, the forward failure that triggered the unwind.
    /// For `Failed`, the compensation failure that stopped it.
    pub error: Option<StepFailure>,
    /// For `Failed`, completed steps whose compensation was never attempted,
    /// in forward order. The step whose compensation failed is in `error`.
    pub pending_compensation: Vec<usize>,
}

impl SagaOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == SagaStatus::Completed
    }

    pub fn is_compensated(&self) -> bool {
        self.status == SagaStatus::Compensated
    }

    /// True when an operator has to intervene.
    pub fn needs_intervention(&self) -> bool {
        self.status == SagaStatus::Failed
    }
}

/// A saga instance and its progress through its definition.
///
/// Only the drivers in this crate mutate an instance, and every mutation
/// goes through a method that checks the lifecycle. Callers get read-only
/// access through the query methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    id: SagaId,
    definition_name: String,
    status: SagaStatus,
    current_step: usize,
    /// Steps whose forward action succeeded, in execution order.
    completed_steps: Vec<usize>,
    /// Completed steps still to be unwound; consumed from the back.
    #[serde(default)]
    pending_compensation: Vec<usize>,
    #[serde(default)]
    compensated_steps: Vec<usize>,
    #[serde(default)]
    skipped_compensations: Vec<usize>,
    /// The step whose compensation gave up, once `Failed`.
    #[serde(default)]
    failed_compensation: Option<usize>,
    payload: Payload,
    initial_payload: Payload,
    /// Payload right after each completed step's forward action.
    #[serde(default)]
    snapshots: BTreeMap<usize, Payload>,
    /// Failed forward attempts per step.
    #[serde(default)]
    step_attempts: BTreeMap<usize, u32>,
    /// Failed compensating attempts per step.
    #[serde(default)]
    compensation_attempts: BTreeMap<usize, u32>,
    /// Failures with a known outcome per step; timeouts do not count.
    #[serde(default)]
    step_epochs: BTreeMap<usize, u32>,
    #[serde(default)]
    compensation_epochs: BTreeMap<usize, u32>,
    trigger_error: Option<StepFailure>,
    last_error: Option<StepFailure>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    version: Version,
}

impl SagaInstance {
    /// Creates a `Pending` instance.
    pub fn new(id: SagaId, definition_name: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id,
            definition_name: definition_name.into(),
            status: SagaStatus::Pending,
            current_step: 0,
            completed_steps: Vec::new(),
            pending_compensation: Vec::new(),
            compensated_steps: Vec::new(),
            skipped_compensations: Vec::new(),
            failed_compensation: None,
            initial_payload: payload.clone(),
            payload,
            snapshots: BTreeMap::new(),
            step_attempts: BTreeMap::new(),
            compensation_attempts: BTreeMap::new(),
            step_epochs: BTreeMap::new(),
            compensation_epochs: BTreeMap::new(),
            trigger_error: None,
            last_error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Serializes the instance for the store.
    pub fn to_record(&self) -> Result<SagaRecord> {
        Ok(SagaRecord {
            id: self.id,
            definition_name: self.definition_name.clone(),
            status: self.status,
            version: self.version,
            initial_payload: self.initial_payload.clone().into_value(),
            state: serde_json::to_value(self)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Rebuilds an instance from a stored record.
    pub fn from_record(record: SagaRecord) -> Result<Self> {
        let mut instance: SagaInstance = serde_json::from_value(record.state)?;
        instance.version = record.version;
        instance.status = record.status;
        Ok(instance)
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    // -- lifecycle --

    pub(crate) fn start(&mut self, step_count: usize) -> Result<()> {
        self.transition(SagaStatus::Running)?;
        self.current_step = 0;
        self.record(SagaEvent::SagaStarted(SagaStartedData {
            definition_name: self.definition_name.clone(),
            step_count,
        }));
        Ok(())
    }

    pub(crate) fn record_forward_success(
        &mut self,
        index: usize,
        step_name: &str,
        patch: Payload,
    ) -> Result<()> {
        self.expect_forward_at(index)?;
        let attempt_epoch = self.epoch(index, Phase::Forward);
        let conflicts = self.payload.merge(patch);
        self.completed_steps.push(index);
        self.snapshots.insert(index, self.payload.clone());
        self.current_step = index + 1;
        self.record(SagaEvent::StepSucceeded(StepSucceededData {
            step_index: index,
            step_name: step_name.to_string(),
            attempt_epoch,
            conflicts,
        }));
        Ok(())
    }

    /// Records a failed forward attempt. On `GiveUp` the instance moves to
    /// `Compensating`.
    pub(crate) fn record_forward_failure(
        &mut self,
        index: usize,
        step_name: &str,
        error: StepError,
        decision: RetryDecision,
    ) -> Result<()> {
        self.expect_forward_at(index)?;
        let attempt = bump(&mut self.step_attempts, index);
        if !outcome_unknown(&error) {
            bump(&mut self.step_epochs, index);
        }
        let failure = StepFailure {
            step_index: index,
            step_name: step_name.to_string(),
            phase: Phase::Forward,
            error: error.clone(),
        };
        self.last_error = Some(failure.clone());
        self.record(SagaEvent::AttemptFailed(AttemptFailedData {
            step_index: index,
            step_name: step_name.to_string(),
            phase: Phase::Forward,
            attempt,
            error: error.clone(),
            retry_delay_ms: retry_delay_ms(decision),
        }));

        if decision == RetryDecision::GiveUp {
            self.transition(SagaStatus::Compensating)?;
            self.pending_compensation = self.completed_steps.clone();
            self.trigger_error = Some(failure);
            self.record(SagaEvent::CompensationStarted(CompensationStartedData {
                from_step: index,
                pending: self.pending_compensation.clone(),
                reason: error,
            }));
        }
        Ok(())
    }

    pub(crate) fn complete(&mut self, step_count: usize) -> Result<()> {
        if self.current_step < step_count {
            return Err(self.invalid(format!(
                "cannot complete with step {} of {step_count} outstanding",
                self.current_step
            )));
        }
        self.transition(SagaStatus::Completed)?;
        self.record(SagaEvent::SagaCompleted);
        Ok(())
    }

    pub(crate) fn record_compensation_success(
        &mut self,
        index: usize,
        step_name: &str,
        patch: Payload,
    ) -> Result<()> {
        self.expect_compensation_of(index)?;
        let attempt_epoch = self.epoch(index, Phase::Compensate);
        let conflicts = self.payload.merge(patch);
        self.pending_compensation.pop();
        self.compensated_steps.push(index);
        self.record(SagaEvent::CompensationSucceeded(StepSucceededData {
            step_index: index,
            step_name: step_name.to_string(),
            attempt_epoch,
            conflicts,
        }));
        Ok(())
    }

    pub(crate) fn record_compensation_skipped(&mut self, index: usize, step_name: &str) -> Result<()> {
        self.expect_compensation_of(index)?;
        self.pending_compensation.pop();
        self.skipped_compensations.push(index);
        self.record(SagaEvent::CompensationSkipped(StepData {
            step_index: index,
            step_name: step_name.to_string(),
        }));
        Ok(())
    }

    /// Records a failed compensating attempt. On `GiveUp` the instance
    /// moves to `Failed`; the step leaves the pending list and is kept as
    /// the failed compensation.
    pub(crate) fn record_compensation_failure(
        &mut self,
        index: usize,
        step_name: &str,
        error: StepError,
        decision: RetryDecision,
    ) -> Result<()> {
        self.expect_compensation_of(index)?;
        let attempt = bump(&mut self.compensation_attempts, index);
        if !outcome_unknown(&error) {
            bump(&mut self.compensation_epochs, index);
        }
        self.last_error = Some(StepFailure {
            step_index: index,
            step_name: step_name.to_string(),
            phase: Phase::Compensate,
            error: error.clone(),
        });
        self.record(SagaEvent::AttemptFailed(AttemptFailedData {
            step_index: index,
            step_name: step_name.to_string(),
            phase: Phase::Compensate,
            attempt,
            error: error.clone(),
            retry_delay_ms: retry_delay_ms(decision),
        }));

        if decision == RetryDecision::GiveUp {
            self.transition(SagaStatus::Failed)?;
            self.pending_compensation.pop();
            self.failed_compensation = Some(index);
            self.record(SagaEvent::SagaFailed(SagaFailedData {
                step_index: index,
                error,
                pending: self.pending_compensation.clone(),
            }));
        }
        Ok(())
    }

    pub(crate) fn finish_compensation(&mut self) -> Result<()> {
        if !self.pending_compensation.is_empty() {
            return Err(self.invalid(format!(
                "compensation still pending for steps {:?}",
                self.pending_compensation
            )));
        }
        self.transition(SagaStatus::Compensated)?;
        self.record(SagaEvent::SagaCompensated);
        Ok(())
    }

    // -- invocation helpers --

    /// Token for the next attempt of `index` in `phase`.
    ///
    /// A retry after a timeout reuses the timed-out call's token, since
    /// that call may still have taken effect.
    pub fn token(&self, index: usize, phase: Phase) -> IdempotencyToken {
        IdempotencyToken {
            saga_id: self.id,
            step_index: index,
            phase,
            attempt_epoch: self.epoch(index, phase),
        }
    }

    pub(crate) fn context(&self, index: usize, phase: Phase, step_name: &str) -> StepContext {
        StepContext {
            token: self.token(index, phase),
            definition_name: self.definition_name.clone(),
            step_name: step_name.to_string(),
        }
    }

    /// Input for the compensation of `index`: the payload as it stood
    /// right after that step's forward action.
    pub(crate) fn compensation_input(&self, index: usize) -> Result<Payload> {
        self.snapshots
            .get(&index)
            .cloned()
            .ok_or_else(|| self.invalid(format!("no payload snapshot for step {index}")))
    }

    /// The terminal result, or the current position for a live instance.
    pub fn outcome(&self) -> SagaOutcome {
        let error = match self.status {
            SagaStatus::Compensated | SagaStatus::Compensating => self.trigger_error.clone(),
            SagaStatus::Failed => self.last_error.clone(),
            _ => None,
        };
        let pending_compensation = match self.status {
            SagaStatus::Failed | SagaStatus::Compensating => self.pending_compensation.clone(),
            _ => Vec::new(),
        };
        SagaOutcome {
            saga_id: self.id,
            status: self.status,
            payload: self.payload.clone(),
            error,
            pending_compensation,
        }
    }

    // -- internals --

    fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(format!("cannot move to {next}")));
        }
        self.status = next;
        Ok(())
    }

    fn expect_forward_at(&self, index: usize) -> Result<()> {
        if self.status != SagaStatus::Running || self.current_step != index {
            return Err(self.invalid(format!(
                "forward result for step {index} but current step is {}",
                self.current_step
            )));
        }
        Ok(())
    }

    fn expect_compensation_of(&self, index: usize) -> Result<()> {
        if self.status != SagaStatus::Compensating || self.pending_compensation.last() != Some(&index) {
            return Err(self.invalid(format!(
                "compensation result for step {index} but next to unwind is {:?}",
                self.pending_compensation.last()
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> SagaError {
        SagaError::InvalidState {
            saga_id: self.id,
            status: self.status,
            reason,
        }
    }

    fn record(&mut self, event: SagaEvent) {
        let entry = HistoryEntry::now(event);
        self.updated_at = entry.at;
        self.history.push(entry);
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn definition_name(&self) -> &str {
        &self.definition_name
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn completed_steps(&self) -> &[usize] {
        &self.completed_steps
    }

    /// Completed steps not yet unwound, in forward order.
    pub fn pending_compensation(&self) -> &[usize] {
        &self.pending_compensation
    }

    /// Steps whose compensation succeeded, in the order they were undone.
    pub fn compensated_steps(&self) -> &[usize] {
        &self.compensated_steps
    }

    /// Completed steps skipped during the unwind for lack of a compensation.
    pub fn skipped_compensations(&self) -> &[usize] {
        &self.skipped_compensations
    }

    pub fn failed_compensation(&self) -> Option<usize> {
        self.failed_compensation
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn initial_payload(&self) -> &Payload {
        &self.initial_payload
    }

    pub fn snapshot(&self, index: usize) -> Option<&Payload> {
        self.snapshots.get(&index)
    }

    /// Failed attempts so far for `index` in `phase`.
    pub fn attempts(&self, index: usize, phase: Phase) -> u32 {
        let counters = match phase {
            Phase::Forward => &self.step_attempts,
            Phase::Compensate => &self.compensation_attempts,
        };
        counters.get(&index).copied().unwrap_or(0)
    }

    /// Epoch of the next attempt for `index` in `phase`.
    pub fn epoch(&self, index: usize, phase: Phase) -> u32 {
        let counters = match phase {
            Phase::Forward => &self.step_epochs,
            Phase::Compensate => &self.compensation_epochs,
        };
        counters.get(&index).copied().unwrap_or(0)
    }

    /// The forward failure that started compensation, if any.
    pub fn trigger_error(&self) -> Option<&StepFailure> {
        self.trigger_error.as_ref()
    }

    pub fn last_error(&self) -> Option<&StepFailure> {
        self.last_error.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

fn bump(counters: &mut BTreeMap<usize, u32>, index: usize) -> u32 {
    let count = counters.entry(index).or_insert(0);
    *count += 1;
    *count
}

fn outcome_unknown(error: &StepError) -> bool {
    error.kind == StepErrorKind::Timeout
}

fn retry_delay_ms(decision: RetryDecision) -> Option<u64> {
    match decision {
        RetryDecision::Retry(delay) => Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
        RetryDecision::GiveUp => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use serde_json::json;

    fn instance() -> SagaInstance {
        let payload = Payload::try_from(json!({"order_id": "o-1"})).unwrap();
        SagaInstance::new(SagaId::new(), "OrderFulfillment", payload)
    }

    fn patch(value: serde_json::Value) -> Payload {
        Payload::try_from(value).unwrap()
    }

    #[test]
    fn new_instance_is_pending() {
        let saga = instance();
        assert_eq!(saga.status(), SagaStatus::Pending);
        assert!(saga.completed_steps().is_empty());
        assert_eq!(saga.version(), Version::initial());
        assert_eq!(saga.payload(), saga.initial_payload());
    }

    #[test]
    fn forward_success_tracks_progress_and_snapshots() {
        let mut saga = instance();
        saga.start(3).unwrap();
        saga.record_forward_success(0, "reserve", patch(json!({"reservation": "r-1"})))
            .unwrap();
        saga.record_forward_success(1, "charge", patch(json!({"payment": "p-1"})))
            .unwrap();

        assert_eq!(saga.completed_steps(), &[0, 1]);
        assert_eq!(saga.current_step(), 2);
        assert!(saga.snapshot(0).unwrap().get("payment").is_none());
        assert_eq!(saga.snapshot(1).unwrap().get("payment"), Some(&json!("p-1")));
    }

    #[test]
    fn out_of_order_results_are_rejected() {
        let mut saga = instance();
        saga.start(3).unwrap();
        let result = saga.record_forward_success(1, "charge", Payload::new());
        assert!(matches!(result, Err(SagaError::InvalidState { .. })));
    }

    #[test]
    fn retry_keeps_running_and_bumps_epoch() {
        let mut saga = instance();
        saga.start(2).unwrap();
        assert_eq!(saga.token(0, Phase::Forward).attempt_epoch, 0);

        saga.record_forward_failure(
            0,
            "reserve",
            StepError::transient("busy"),
            RetryDecision::Retry(Duration::from_millis(5)),
        )
        .unwrap();

        assert_eq!(saga.status(), SagaStatus::Running);
        assert_eq!(saga.attempts(0, Phase::Forward), 1);
        assert_eq!(saga.token(0, Phase::Forward).attempt_epoch, 1);
        assert_eq!(saga.last_error().unwrap().error.message, "busy");
    }

    #[test]
    fn timeout_retry_keeps_epoch() {
        let mut saga = instance();
        saga.start(2).unwrap();
        let retry = RetryDecision::Retry(Duration::from_millis(5));

        saga.record_forward_failure(0, "charge", StepError::timeout(Duration::from_millis(20)), retry)
            .unwrap();
        assert_eq!(saga.attempts(0, Phase::Forward), 1);
        assert_eq!(saga.token(0, Phase::Forward).attempt_epoch, 0);

        saga.record_forward_failure(0, "charge", StepError::transient("busy"), retry)
            .unwrap();
        assert_eq!(saga.attempts(0, Phase::Forward), 2);
        assert_eq!(saga.token(0, Phase::Forward).attempt_epoch, 1);
    }

    #[test]
    fn give_up_enters_compensating_with_completed_steps_pending() {
        let mut saga = instance();
        saga.start(3).unwrap();
        saga.record_forward_success(0, "reserve", Payload::new()).unwrap();
        saga.record_forward_success(1, "charge", Payload::new()).unwrap();
        saga.record_forward_failure(2, "ship", StepError::permanent("no address"), RetryDecision::GiveUp)
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.pending_compensation(), &[0, 1]);
        assert_eq!(saga.completed_steps(), &[0, 1]);
        assert_eq!(saga.trigger_error().unwrap().step_index, 2);
    }

    #[test]
    fn compensation_unwinds_from_the_back() {
        let mut saga = instance();
        saga.start(3).unwrap();
        saga.record_forward_success(0, "reserve", Payload::new()).unwrap();
        saga.record_forward_success(1, "email", Payload::new()).unwrap();
        saga.record_forward_failure(2, "ship", StepError::permanent("x"), RetryDecision::GiveUp)
            .unwrap();

        assert!(saga.record_compensation_success(0, "reserve", Payload::new()).is_err());

        saga.record_compensation_skipped(1, "email").unwrap();
        saga.record_compensation_success(0, "reserve", patch(json!({"released": true})))
            .unwrap();
        saga.finish_compensation().unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.skipped_compensations(), &[1]);
        assert_eq!(saga.compensated_steps(), &[0]);
        assert_eq!(saga.completed_steps(), &[0, 1]);

        let outcome = saga.outcome();
        assert!(outcome.is_compensated());
        assert_eq!(outcome.error.unwrap().step_index, 2);
        assert_eq!(outcome.payload.get("released"), Some(&json!(true)));
    }

    #[test]
    fn compensation_give_up_fails_and_keeps_pending() {
        let mut saga = instance();
        saga.start(3).unwrap();
        saga.record_forward_success(0, "reserve", Payload::new()).unwrap();
        saga.record_forward_success(1, "charge", Payload::new()).unwrap();
        saga.record_forward_failure(2, "ship", StepError::permanent("x"), RetryDecision::GiveUp)
            .unwrap();
        saga.record_compensation_failure(1, "charge", StepError::permanent("refund rejected"), RetryDecision::GiveUp)
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Failed);
        assert_eq!(saga.failed_compensation(), Some(1));
        let outcome = saga.outcome();
        assert!(outcome.needs_intervention());
        assert_eq!(outcome.pending_compensation, vec![0]);
        let error = outcome.error.unwrap();
        assert_eq!(error.phase, Phase::Compensate);
        assert_eq!(error.step_index, 1);
    }

    #[test]
    fn terminal_instances_reject_mutation() {
        let mut saga = instance();
        saga.start(1).unwrap();
        saga.record_forward_success(0, "only", Payload::new()).unwrap();
        saga.complete(1).unwrap();

        assert!(saga.start(1).is_err());
        assert!(saga.complete(1).is_err());
        assert!(
            saga.record_forward_failure(0, "only", StepError::permanent("x"), RetryDecision::GiveUp)
                .is_err()
        );
        assert_eq!(saga.status(), SagaStatus::Completed);
    }

    #[test]
    fn complete_requires_all_steps() {
        let mut saga = instance();
        saga.start(2).unwrap();
        saga.record_forward_success(0, "a", Payload::new()).unwrap();
        assert!(saga.complete(2).is_err());
    }

    #[test]
    fn record_roundtrip_preserves_progress() {
        let mut saga = instance();
        saga.start(2).unwrap();
        saga.record_forward_success(0, "reserve", patch(json!({"reservation": "r-9"})))
            .unwrap();
        saga.set_version(Version::new(3));

        let record = saga.to_record().unwrap();
        assert_eq!(record.status, SagaStatus::Running);
        assert_eq!(record.initial_payload, json!({"order_id": "o-1"}));

        let restored = SagaInstance::from_record(record).unwrap();
        assert_eq!(restored.version(), Version::new(3));
        assert_eq!(restored.completed_steps(), &[0]);
        assert_eq!(restored.snapshot(0), saga.snapshot(0));
        assert_eq!(restored.history().len(), saga.history().len());
    }
}
