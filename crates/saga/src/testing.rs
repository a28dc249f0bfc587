//! Scriptable step invokers for tests and benchmarks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::invoker::{IdempotencyToken, Phase, StepContext, StepError, StepInvoker};
use crate::payload::Payload;

/// One invocation seen by a [`RecordingInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub step_name: String,
    pub phase: Phase,
    pub token: IdempotencyToken,
    pub payload: Payload,
}

/// Ordered log of calls, shared by every invoker created from it.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Step names of forward calls, in call order.
    pub fn forward_steps(&self) -> Vec<String> {
        self.steps_in(Phase::Forward)
    }

    /// Step names of compensating calls, in call order.
    pub fn compensation_steps(&self) -> Vec<String> {
        self.steps_in(Phase::Compensate)
    }

    /// Number of calls to `step_name` in `phase`.
    pub fn count(&self, step_name: &str, phase: Phase) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.step_name == step_name && c.phase == phase)
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.calls).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    fn steps_in(&self, phase: Phase) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.phase == phase)
            .map(|c| c.step_name.clone())
            .collect()
    }

    fn push(&self, call: RecordedCall) {
        lock(&self.calls).push(call);
    }
}

#[derive(Debug, Default)]
struct Script {
    forward_output: Payload,
    compensation_output: Payload,
    fail_forward: Option<StepError>,
    forward_failures: VecDeque<StepError>,
    fail_compensate: Option<StepError>,
    compensation_failures: VecDeque<StepError>,
    forward_delay: Option<Duration>,
    compensation_delay: Option<Duration>,
}

/// Step invoker that logs every call and answers from a script.
///
/// By default both phases succeed with an empty patch.
#[derive(Debug, Clone)]
pub struct RecordingInvoker {
    log: CallLog,
    script: Arc<Mutex<Script>>,
}

impl RecordingInvoker {
    /// Creates an invoker that records into `log`.
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            script: Arc::default(),
        }
    }

    /// Patch returned by successful forward calls.
    pub fn set_forward_output(&self, output: Payload) {
        lock(&self.script).forward_output = output;
    }

    /// Patch returned by successful compensating calls.
    pub fn set_compensation_output(&self, output: Payload) {
        lock(&self.script).compensation_output = output;
    }

    /// Makes every forward call fail with `error`, or clears it with `None`.
    pub fn set_fail_forward(&self, error: Option<StepError>) {
        lock(&self.script).fail_forward = error;
    }

    /// Fails the next `times` forward calls with `error`, then succeeds.
    pub fn fail_next_forward(&self, times: usize, error: StepError) {
        lock(&self.script)
            .forward_failures
            .extend(std::iter::repeat_n(error, times));
    }

    /// Makes every compensating call fail with `error`, or clears it.
    pub fn set_fail_compensate(&self, error: Option<StepError>) {
        lock(&self.script).fail_compensate = error;
    }

    /// Fails the next `times` compensating calls with `error`.
    pub fn fail_next_compensate(&self, times: usize, error: StepError) {
        lock(&self.script)
            .compensation_failures
            .extend(std::iter::repeat_n(error, times));
    }

    /// Sleeps this long inside every call before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        let mut script = lock(&self.script);
        script.forward_delay = delay;
        script.compensation_delay = delay;
    }

    /// Like [`set_delay`](Self::set_delay), for compensating calls only.
    pub fn set_compensation_delay(&self, delay: Option<Duration>) {
        lock(&self.script).compensation_delay = delay;
    }

    async fn answer(&self, ctx: &StepContext, payload: &Payload) -> Result<Payload, StepError> {
        self.log.push(RecordedCall {
            step_name: ctx.step_name.clone(),
            phase: ctx.phase(),
            token: ctx.token.clone(),
            payload: payload.clone(),
        });

        let delay = match ctx.phase() {
            Phase::Forward => lock(&self.script).forward_delay,
            Phase::Compensate => lock(&self.script).compensation_delay,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = lock(&self.script);
        let script = &mut *script;
        let (always, queued, output) = match ctx.phase() {
            Phase::Forward => (
                &script.fail_forward,
                &mut script.forward_failures,
                &script.forward_output,
            ),
            Phase::Compensate => (
                &script.fail_compensate,
                &mut script.compensation_failures,
                &script.compensation_output,
            ),
        };
        if let Some(error) = queued.pop_front() {
            return Err(error);
        }
        if let Some(error) = always {
            return Err(error.clone());
        }
        Ok(output.clone())
    }
}

#[async_trait]
impl StepInvoker for RecordingInvoker {
    async fn forward(&self, ctx: &StepContext, payload: &Payload) -> Result<Payload, StepError> {
        self.answer(ctx, payload).await
    }

    async fn compensate(&self, ctx: &StepContext, payload: &Payload) -> Result<Payload, StepError> {
        self.answer(ctx, payload).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
