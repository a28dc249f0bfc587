//! Saga history events.
//!
//! Every transition appends one event to the instance's history. The
//! history is diagnostic: state is carried by the instance fields, not
//! replayed from these entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invoker::{Phase, StepError};
use crate::payload::FieldConflict;

/// Events recorded during saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The instance left `Pending`.
    SagaStarted(SagaStartedData),

    /// A forward action succeeded.
    StepSucceeded(StepSucceededData),

    /// A forward or compensating attempt failed.
    AttemptFailed(AttemptFailedData),

    /// A forward action gave up and the unwind began.
    CompensationStarted(CompensationStartedData),

    /// A compensating action succeeded.
    CompensationSucceeded(StepSucceededData),

    /// A completed step had no compensating action.
    CompensationSkipped(StepData),

    /// Every forward action succeeded.
    SagaCompleted,

    /// Every completed step was undone or skipped.
    SagaCompensated,

    /// A compensation gave up; the remaining steps need an operator.
    SagaFailed(SagaFailedData),
}

impl SagaEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepSucceeded(_) => "StepSucceeded",
            SagaEvent::AttemptFailed(_) => "AttemptFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationSucceeded(_) => "CompensationSucceeded",
            SagaEvent::CompensationSkipped(_) => "CompensationSkipped",
            SagaEvent::SagaCompleted => "SagaCompleted",
            SagaEvent::SagaCompensated => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// A history event with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: SagaEvent,
}

impl HistoryEntry {
    pub fn now(event: SagaEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub definition_name: String,
    pub step_count: usize,
}

/// Identifies a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_index: usize,
    pub step_name: String,
}

/// Data for successful forward and compensating actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSucceededData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt_epoch: u32,
    /// Payload fields this step overwrote with a different value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FieldConflict>,
}

/// Data for AttemptFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub phase: Phase,
    /// 1-based count of failures for this step and phase.
    pub attempt: u32,
    pub error: StepError,
    /// Set when the policy chose to retry.
    pub retry_delay_ms: Option<u64>,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    /// The step whose failure triggered the unwind.
    pub from_step: usize,
    /// Completed steps to unwind, in forward order.
    pub pending: Vec<usize>,
    pub reason: StepError,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    /// The step whose compensation gave up.
    pub step_index: usize,
    pub error: StepError,
    /// Completed steps whose compensation was never attempted.
    pub pending: Vec<usize>,
}
