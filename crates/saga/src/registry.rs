//! Named invokers and serializable definition specs.
//!
//! Embedding applications register their concrete service clients once,
//! then describe saga types as data. Names are resolved when a definition
//! is loaded, so a typo fails at configuration time rather than mid-saga.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError};
use crate::invoker::StepInvoker;
use crate::retry::ExponentialBackoff;

/// Serializable description of a saga type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinitionSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

/// Serializable description of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Registry name of the forward invoker.
    pub invoker: String,
    /// Registry name of a separate compensating invoker. Defaults to
    /// `invoker` when the step is compensable.
    #[serde(default)]
    pub compensate_with: Option<String>,
    #[serde(default = "default_compensable")]
    pub compensable: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-step attempt cap; uses exponential backoff defaults otherwise.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_compensable() -> bool {
    true
}

/// Maps invoker names to instances.
#[derive(Clone, Default)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn StepInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `invoker` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, invoker: Arc<dyn StepInvoker>) -> &mut Self {
        self.invokers.insert(name.into(), invoker);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepInvoker>> {
        self.invokers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.invokers.contains_key(name)
    }

    /// Builds a validated definition from `spec`.
    pub fn resolve(&self, spec: &SagaDefinitionSpec) -> Result<SagaDefinition> {
        let lookup = |step: &StepSpec, invoker: &str| {
            self.get(invoker).ok_or_else(|| SagaError::UnknownInvoker {
                definition: spec.name.clone(),
                step: step.name.clone(),
                invoker: invoker.to_string(),
            })
        };

        let mut steps = Vec::with_capacity(spec.steps.len());
        for step_spec in &spec.steps {
            let forward = lookup(step_spec, &step_spec.invoker)?;
            let mut step = if step_spec.compensable {
                match &step_spec.compensate_with {
                    Some(name) => StepDefinition::new(step_spec.name.clone(), forward)
                        .with_compensation(lookup(step_spec, name)?),
                    None => StepDefinition::new(step_spec.name.clone(), forward),
                }
            } else {
                StepDefinition::irreversible(step_spec.name.clone(), forward)
            };

            if let Some(ms) = step_spec.timeout_ms {
                step = step.with_timeout(Duration::from_millis(ms));
            }
            if let Some(max_attempts) = step_spec.max_attempts {
                step = step.with_retry(Arc::new(
                    ExponentialBackoff::new().with_max_attempts(max_attempts),
                ));
            }
            steps.push(step);
        }

        SagaDefinition::new(spec.name.clone(), steps)
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.invokers.keys().collect();
        names.sort();
        f.debug_struct("InvokerRegistry")
            .field("invokers", &names)
            .finish()
    }
}
