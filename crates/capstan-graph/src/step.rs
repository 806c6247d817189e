//! Step trait, closure adapter, and the step registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use capstan_types::{Result, State, StateUpdate, WorkflowError};

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A named unit of work: a pure transformation from the current state to a
/// partial update. Steps hold no memory between invocations; all run state
/// lives in [`State`]. Side effects (LLM calls, file I/O) are permitted but
/// must be safe under at-least-once re-invocation, since the engine may
/// retry a failed step with the same input state.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, state: State) -> Result<StateUpdate>;
}

// ---------------------------------------------------------------------------
// FnStep: closure adapter
// ---------------------------------------------------------------------------

/// Adapts an async closure into a [`Step`].
pub struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(State) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate>> + Send,
{
    async fn run(&self, state: State) -> Result<StateUpdate> {
        (self.0)(state).await
    }
}

/// Wrap an async closure as a step:
///
/// ```ignore
/// builder.add_step("load", step_fn(|state| async move {
///     Ok(StateUpdate::new().set("raw", json!("...")))
/// }));
/// ```
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(State) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate>> + Send,
{
    FnStep(f)
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Immutable after graph compilation; shared read-only across all runs.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a unique name with a step. Returns `false` (and leaves the
    /// registry unchanged) when the name is already taken; the builder
    /// reports that as a validation error.
    pub fn register(&mut self, name: impl Into<String>, step: impl Step + 'static) -> bool {
        let name = name.into();
        if self.steps.contains_key(&name) {
            return false;
        }
        self.steps.insert(name, Arc::new(step));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// Invoke a registered step. Fails with `UnknownStep` for unregistered
    /// names; any failure raised by the step itself is propagated as
    /// `StepFailure { step, cause }`.
    pub async fn invoke(&self, name: &str, state: State) -> Result<StateUpdate> {
        let step = self
            .steps
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownStep {
                step: name.to_string(),
            })?;

        step.run(state).await.map_err(|e| match e {
            already @ WorkflowError::StepFailure { .. } => already,
            other => WorkflowError::StepFailure {
                step: name.to_string(),
                cause: other.to_string(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
