//! Immutable saga definitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SagaError};
use crate::invoker::StepInvoker;
use crate::retry::RetryPolicy;

/// One step of a saga: a forward action and an optional compensation.
///
/// A step without a compensation is irreversible (an email already sent).
/// During an unwind it is skipped and the skip recorded.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    forward: Arc<dyn StepInvoker>,
    compensate: Option<Arc<dyn StepInvoker>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    timeout: Option<Duration>,
}

impl StepDefinition {
    /// A reversible step whose invoker serves both phases.
    ///
    /// The invoker's `compensate` is called during an unwind, so it must
    /// be implemented. The trait's default refuses, which leaves the saga
    /// `Failed`. Use [`irreversible`](Self::irreversible) for a step that
    /// cannot be undone.
    pub fn new(name: impl Into<String>, invoker: Arc<dyn StepInvoker>) -> Self {
        Self {
            name: name.into(),
            forward: invoker.clone(),
            compensate: Some(invoker),
            retry: None,
            timeout: None,
        }
    }

    /// A step that cannot be undone.
    pub fn irreversible(name: impl Into<String>, invoker: Arc<dyn StepInvoker>) -> Self {
        Self {
            compensate: None,
            ..Self::new(name, invoker)
        }
    }

    /// Uses a separate invoker for the compensating action.
    pub fn with_compensation(mut self, invoker: Arc<dyn StepInvoker>) -> Self {
        self.compensate = Some(invoker);
        self
    }

    /// Overrides the orchestrator's default retry policy for this step.
    pub fn with_retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Overrides the orchestrator's default bounded wait for this step.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward(&self) -> &Arc<dyn StepInvoker> {
        &self.forward
    }

    pub fn compensation(&self) -> Option<&Arc<dyn StepInvoker>> {
        self.compensate.as_ref()
    }

    pub fn is_compensable(&self) -> bool {
        self.compensate.is_some()
    }

    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("compensable", &self.is_compensable())
            .field("custom_retry", &self.retry.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An ordered, validated, immutable sequence of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    /// Validates and builds a definition.
    ///
    /// The name must be non-empty, there must be at least one step, and
    /// step names must be non-empty and unique.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| SagaError::InvalidDefinition {
            name: name.clone(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("saga name is empty".to_string()));
        }
        if steps.is_empty() {
            return Err(invalid("a saga needs at least one step".to_string()));
        }

        let mut seen = HashSet::new();
        for (index, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(invalid(format!("step {index} has an empty name")));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
        }

        Ok(Self { name, steps })
    }

    /// Starts a builder for a definition called `name`.
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    /// Number of steps. Never zero.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinitionBuilder {
    /// Appends a step.
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<SagaDefinition> {
        SagaDefinition::new(self.name, self.steps)
    }
}

/// Definitions known to a driver, by name.
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition. Names must be unique.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        if self.definitions.contains_key(definition.name()) {
            return Err(SagaError::DuplicateDefinition(definition.name().to_string()));
        }
        self.definitions
            .insert(definition.name().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Looks up a definition by name.
    pub fn get(&self, name: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::DefinitionNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}
