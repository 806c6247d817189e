//! The execution engine: the core traversal loop.
//!
//! Drives one logical run at a time through its graph: route, invoke, merge,
//! checkpoint. Houses the retry/rollback policy and the human-gate
//! suspend/resume contract. A run is always in exactly one of four states:
//! `Running`, `SuspendedForHuman`, `Completed`, `Failed`; callers always get
//! back one of the three terminal framings (final state, pending decision,
//! or failure report with the full error trace).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use capstan_graph::{Graph, Next};
use capstan_types::{
    Checkpoint, Decision, FailureReport, PendingDecision, Result, RunStatus, State, StepError,
    ThreadId, WorkflowError,
};

use crate::checkpoint::CheckpointStore;
use crate::events::{EventEmitter, WorkflowEvent};
use crate::retry::BackoffPolicy;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What the engine does with a failed step while retry budget remains.
/// Retry-in-place and rollback are distinct, explicitly configured routes;
/// the engine never combines them automatically.
#[derive(Debug, Clone, Default)]
pub enum ErrorPolicy {
    /// Re-enter the failed step with the same state.
    #[default]
    RetryInPlace,
    /// Restore the checkpoint of the most recent successful step and
    /// re-enter at its recorded position, discarding everything since.
    Rollback,
    /// Route to a designated handler step, which may itself route back to
    /// the failed step, to an earlier step, or to END.
    Route(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum attempts per step before the run fails. Default 3.
    pub retry_limit: u32,
    pub error_policy: ErrorPolicy,
    /// Delay between retry attempts of the same step.
    pub backoff: BackoffPolicy,
    /// Optional engine-level bound on step invocations per run segment.
    /// Graph cycles are otherwise unbounded by design; decision functions
    /// own their loop counters.
    pub max_steps: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            error_policy: ErrorPolicy::default(),
            backoff: BackoffPolicy::default(),
            max_steps: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// The caller-visible result of `start` or `resume`.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Terminal success: the final state plus any failures recovered along
    /// the way.
    Completed {
        state: State,
        trace: Vec<StepError>,
    },
    /// Parked at a human gate awaiting a decision.
    Suspended(PendingDecision),
    /// Terminal failure with the accumulated error trace.
    Failed(FailureReport),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Suspended(_) => RunStatus::SuspendedForHuman,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    graph: Arc<Graph>,
    store: Arc<dyn CheckpointStore>,
    config: EngineConfig,
    events: EventEmitter,
    /// Cooperative cancellation signals for runs in flight in this process;
    /// a set value is the cancellation reason.
    cancels: tokio::sync::RwLock<HashMap<ThreadId, Arc<OnceLock<String>>>>,
}

impl Engine {
    pub fn new(graph: Arc<Graph>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            graph,
            store,
            config: EngineConfig::default(),
            events: EventEmitter::default(),
            cancels: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Begin a fresh run from the graph entry. Fails if the thread already
    /// has checkpoint history (resume instead).
    pub async fn start(&self, thread: ThreadId, initial: State) -> Result<RunOutcome> {
        self.check_policy()?;
        if self.store.latest(&thread).await?.is_some() {
            return Err(WorkflowError::Other(format!(
                "thread '{thread}' already has history; use resume"
            )));
        }

        let entry = self.graph.entry().to_string();
        self.events.emit(WorkflowEvent::RunStarted {
            thread_id: thread.to_string(),
            entry: entry.clone(),
        });
        tracing::info!(thread = %thread, entry = %entry, "run started");

        let cancel = self.register_cancel(&thread).await;
        let outcome = self
            .drive(thread.clone(), initial, entry, Vec::new(), None, cancel)
            .await;
        self.clear_cancel(&thread).await;
        outcome
    }

    /// Resume a run suspended at a human gate. Folds the decision into the
    /// checkpointed state and routes from the gate over the decorated state.
    /// The decision is consumed exactly once: this call moves the thread out
    /// of `SuspendedForHuman`.
    pub async fn resume(&self, thread: &ThreadId, decision: Decision) -> Result<RunOutcome> {
        self.check_policy()?;
        let cp = self
            .store
            .latest(thread)
            .await?
            .ok_or_else(|| WorkflowError::ThreadNotFound {
                thread: thread.to_string(),
            })?;

        match cp.status {
            RunStatus::Completed | RunStatus::Failed => Err(WorkflowError::ThreadTerminated {
                thread: thread.to_string(),
            }),
            RunStatus::Running => Err(WorkflowError::NotSuspended {
                thread: thread.to_string(),
            }),
            RunStatus::SuspendedForHuman => {
                let state = cp.state.merge(&decision.fold_into_update());
                let trace = cp.error_trace.clone();
                self.events.emit(WorkflowEvent::RunResumed {
                    thread_id: thread.to_string(),
                    gate: cp.position.clone(),
                });
                tracing::info!(thread = %thread, gate = %cp.position, "run resumed");

                let cancel = self.register_cancel(thread).await;
                let outcome = match self.graph.next(&cp.position, &state) {
                    Err(e) => {
                        self.fail_run(thread.clone(), &cp.position, state, trace, e.to_string())
                            .await
                    }
                    Ok(Next::End) => {
                        self.complete_run(thread.clone(), &cp.position, state, trace)
                            .await
                    }
                    Ok(Next::Step(next)) => {
                        self.drive(thread.clone(), state, next, trace, None, cancel)
                            .await
                    }
                };
                self.clear_cancel(thread).await;
                outcome
            }
        }
    }

    /// Current run status, from the latest checkpoint.
    pub async fn status(&self, thread: &ThreadId) -> Result<RunStatus> {
        self.store
            .latest(thread)
            .await?
            .map(|cp| cp.status)
            .ok_or_else(|| WorkflowError::ThreadNotFound {
                thread: thread.to_string(),
            })
    }

    /// Latest checkpointed state for a thread.
    pub async fn latest_state(&self, thread: &ThreadId) -> Result<State> {
        self.store.restore(thread).await
    }

    /// Cancel a run between steps. In-flight runs observe the signal at the
    /// next step boundary; a suspended run is failed directly.
    pub async fn cancel(&self, thread: &ThreadId, reason: &str) -> Result<()> {
        if let Some(signal) = self.cancels.read().await.get(thread) {
            let _ = signal.set(reason.to_string());
            tracing::info!(thread = %thread, %reason, "cancellation requested");
            return Ok(());
        }

        match self.store.latest(thread).await? {
            None => Err(WorkflowError::ThreadNotFound {
                thread: thread.to_string(),
            }),
            Some(cp) if cp.status.is_terminal() => Err(WorkflowError::ThreadTerminated {
                thread: thread.to_string(),
            }),
            Some(cp) => {
                let cause = WorkflowError::Cancelled {
                    thread: thread.to_string(),
                    reason: reason.to_string(),
                };
                let mut trace = cp.error_trace;
                trace.push(StepError::new(&cp.position, 0, cause.to_string()));
                let failed = Checkpoint::new(
                    thread.clone(),
                    &cp.position,
                    RunStatus::Failed,
                    cp.state,
                    trace,
                );
                self.store.save(failed).await?;
                self.events.emit(WorkflowEvent::RunFinished {
                    thread_id: thread.to_string(),
                    status: RunStatus::Failed,
                });
                tracing::info!(thread = %thread, %reason, "suspended run cancelled");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_policy(&self) -> Result<()> {
        if let ErrorPolicy::Route(ref handler) = self.config.error_policy {
            if !self.graph.has_step(handler) && !self.graph.is_gate(handler) {
                return Err(WorkflowError::ValidationError(format!(
                    "error handler step '{handler}' is not registered"
                )));
            }
        }
        Ok(())
    }

    async fn register_cancel(&self, thread: &ThreadId) -> Arc<OnceLock<String>> {
        let signal = Arc::new(OnceLock::new());
        self.cancels
            .write()
            .await
            .insert(thread.clone(), signal.clone());
        signal
    }

    async fn clear_cancel(&self, thread: &ThreadId) {
        self.cancels.write().await.remove(thread);
    }

    /// The main loop: route, invoke, merge, checkpoint, repeat.
    ///
    /// `last_good` is the checkpoint of the most recent step that completed
    /// without error in this segment; it is the single rollback target.
    async fn drive(
        &self,
        thread: ThreadId,
        mut state: State,
        mut current: String,
        mut trace: Vec<StepError>,
        mut last_good: Option<Checkpoint>,
        cancel: Arc<OnceLock<String>>,
    ) -> Result<RunOutcome> {
        let mut invocations: u64 = 0;

        loop {
            if let Some(reason) = cancel.get() {
                let cause = WorkflowError::Cancelled {
                    thread: thread.to_string(),
                    reason: reason.clone(),
                }
                .to_string();
                trace.push(StepError::new(&current, 0, cause.as_str()));
                return self.fail_run(thread, &current, state, trace, cause).await;
            }
            if let Some(limit) = self.config.max_steps {
                if invocations >= limit {
                    let cause = format!("step budget of {limit} invocations exhausted");
                    return self.fail_run(thread, &current, state, trace, cause).await;
                }
            }

            // Human gates are never auto-invoked: persist and hand control
            // back to the caller.
            if self.graph.is_gate(&current) {
                let prompt = self
                    .graph
                    .gate(&current)
                    .map(|g| g.prompt.clone())
                    .unwrap_or_default();
                let cp = Checkpoint::new(
                    thread.clone(),
                    &current,
                    RunStatus::SuspendedForHuman,
                    state.clone(),
                    trace.clone(),
                );
                self.store.save(cp).await?;
                self.events.emit(WorkflowEvent::RunSuspended {
                    thread_id: thread.to_string(),
                    gate: current.clone(),
                });
                tracing::info!(thread = %thread, gate = %current, "run suspended for human decision");
                return Ok(RunOutcome::Suspended(PendingDecision {
                    thread_id: thread,
                    gate: current,
                    prompt,
                    state,
                }));
            }

            self.events.emit(WorkflowEvent::StepStarted {
                thread_id: thread.to_string(),
                step: current.clone(),
            });
            tracing::debug!(thread = %thread, step = %current, seq = state.seq(), "invoking step");
            invocations += 1;

            match self.graph.invoke(&current, state.clone()).await {
                Ok(update) => {
                    state = state.merge(&update).reset_failures(&current);
                    // Checkpoint synchronously before anything can observe
                    // the merge; a crash after this point loses nothing.
                    let cp = Checkpoint::new(
                        thread.clone(),
                        &current,
                        RunStatus::Running,
                        state.clone(),
                        trace.clone(),
                    );
                    self.store.save(cp.clone()).await?;
                    self.events.emit(WorkflowEvent::CheckpointSaved {
                        thread_id: thread.to_string(),
                        position: current.clone(),
                        seq: cp.seq,
                    });
                    self.events.emit(WorkflowEvent::StepCompleted {
                        thread_id: thread.to_string(),
                        step: current.clone(),
                        seq: state.seq(),
                    });
                    last_good = Some(cp);

                    match self.graph.next(&current, &state) {
                        Ok(Next::End) => {
                            return self.complete_run(thread, &current, state, trace).await;
                        }
                        Ok(Next::Step(next)) => current = next,
                        Err(e) => {
                            // Routing defects are fatal, no retry.
                            return self
                                .fail_run(thread, &current, state, trace, e.to_string())
                                .await;
                        }
                    }
                }
                Err(WorkflowError::StepFailure { cause, .. }) => {
                    state = state.record_failure(&current);
                    let attempt = state.error_count(&current);
                    trace.push(StepError::new(&current, attempt, &cause));
                    self.events.emit(WorkflowEvent::StepFailed {
                        thread_id: thread.to_string(),
                        step: current.clone(),
                        attempt,
                        cause: cause.clone(),
                    });
                    tracing::warn!(thread = %thread, step = %current, attempt, %cause, "step failed");

                    if attempt >= self.config.retry_limit {
                        let cause = format!(
                            "step '{current}' failed {attempt} times; retry limit {} reached",
                            self.config.retry_limit
                        );
                        return self.fail_run(thread, &current, state, trace, cause).await;
                    }

                    match self.config.error_policy.clone() {
                        ErrorPolicy::RetryInPlace => {
                            self.pause_before_retry(&thread, &current, attempt).await;
                        }
                        ErrorPolicy::Rollback => match last_good.as_ref() {
                            Some(cp) => {
                                // Discard everything since the last success;
                                // failure counters and the trace survive so
                                // the retry bound still holds.
                                state = cp.state.carry_progress_from(&state);
                                current = cp.position.clone();
                                self.events.emit(WorkflowEvent::RolledBack {
                                    thread_id: thread.to_string(),
                                    to_position: current.clone(),
                                });
                                tracing::info!(thread = %thread, position = %current, "rolled back to last successful checkpoint");
                            }
                            None => {
                                // Nothing has succeeded yet in this segment:
                                // degrade to retry-in-place.
                                self.pause_before_retry(&thread, &current, attempt).await;
                            }
                        },
                        ErrorPolicy::Route(handler) => {
                            tracing::info!(thread = %thread, %handler, "routing failure to error handler");
                            current = handler;
                        }
                    }
                }
                Err(fatal) => {
                    // UnknownStep and friends: construction-time defects.
                    return self
                        .fail_run(thread, &current, state, trace, fatal.to_string())
                        .await;
                }
            }
        }
    }

    async fn pause_before_retry(&self, thread: &ThreadId, step: &str, attempt: u32) {
        let delay = self.config.backoff.delay_for_attempt(attempt.saturating_sub(1));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.events.emit(WorkflowEvent::StepRetrying {
            thread_id: thread.to_string(),
            step: step.to_string(),
            attempt,
        });
    }

    async fn complete_run(
        &self,
        thread: ThreadId,
        position: &str,
        state: State,
        trace: Vec<StepError>,
    ) -> Result<RunOutcome> {
        let cp = Checkpoint::new(
            thread.clone(),
            position,
            RunStatus::Completed,
            state.clone(),
            trace.clone(),
        );
        self.store.save(cp).await?;
        self.events.emit(WorkflowEvent::RunFinished {
            thread_id: thread.to_string(),
            status: RunStatus::Completed,
        });
        tracing::info!(thread = %thread, seq = state.seq(), "run completed");
        Ok(RunOutcome::Completed { state, trace })
    }

    async fn fail_run(
        &self,
        thread: ThreadId,
        position: &str,
        state: State,
        trace: Vec<StepError>,
        cause: String,
    ) -> Result<RunOutcome> {
        let cp = Checkpoint::new(
            thread.clone(),
            position,
            RunStatus::Failed,
            state,
            trace.clone(),
        );
        self.store.save(cp).await?;
        self.events.emit(WorkflowEvent::RunFinished {
            thread_id: thread.to_string(),
            status: RunStatus::Failed,
        });
        tracing::error!(thread = %thread, %cause, "run failed");
        Ok(RunOutcome::Failed(FailureReport {
            thread_id: thread,
            cause,
            trace,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
