//! Shared types for the Capstan workflow engine.
//!
//! This crate provides the foundational types used across all other Capstan
//! crates:
//! - `WorkflowError`: unified error taxonomy
//! - `State` / `StateUpdate`: the immutable-by-convention state container
//! - `RunStatus`, `Checkpoint`, `StepError`: execution snapshots
//! - `Decision`: the record that releases a suspended human gate

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified error type for all Capstan subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // === Graph construction / routing ===
    #[error("Unknown step '{step}'")]
    UnknownStep { step: String },

    #[error("Routing error after step '{step}': {message}")]
    RoutingError { step: String, message: String },

    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    // === Step execution ===
    #[error("Step '{step}' failed: {cause}")]
    StepFailure { step: String, cause: String },

    // === Thread lifecycle ===
    #[error("Thread '{thread}' has already terminated")]
    ThreadTerminated { thread: String },

    #[error("Thread '{thread}' is not suspended; resume is only valid from a human gate")]
    NotSuspended { thread: String },

    #[error("No checkpoint exists for thread '{thread}'")]
    NoCheckpoint { thread: String },

    #[error("Thread '{thread}' not found")]
    ThreadNotFound { thread: String },

    #[error("Thread '{thread}' cancelled: {reason}")]
    Cancelled { thread: String, reason: String },

    // === Collaborator errors ===
    #[error("Upstream {endpoint} unavailable: {message}")]
    UpstreamUnavailable { endpoint: String, message: String },

    #[error("Upstream {endpoint} timed out after {timeout_ms}ms")]
    UpstreamTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WorkflowError {
    /// Returns `true` if the error is transient and the step may succeed
    /// when invoked again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::StepFailure { .. }
                | WorkflowError::UpstreamUnavailable { .. }
                | WorkflowError::UpstreamTimeout { .. }
        )
    }

    /// Returns `true` for construction-time defects and lifecycle misuse
    /// where retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::UnknownStep { .. }
                | WorkflowError::RoutingError { .. }
                | WorkflowError::ValidationError(_)
                | WorkflowError::ThreadTerminated { .. }
                | WorkflowError::Cancelled { .. }
        )
    }
}

/// A convenience alias for `Result<T, WorkflowError>`.
pub type Result<T> = std::result::Result<T, WorkflowError>;

// ---------------------------------------------------------------------------
// ThreadId: opaque identifier for one logical run
// ---------------------------------------------------------------------------

/// Identifies one logical, isolated execution of a graph. All checkpoints,
/// retry counters, and decisions are partitioned by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id (UUID v4).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// RunStatus: the engine's four-state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    SuspendedForHuman,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::SuspendedForHuman => "suspended_for_human",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// State: the immutable-by-convention field map
// ---------------------------------------------------------------------------

/// Pipeline state: named fields plus a monotonically increasing sequence
/// number and a per-step failure counter.
///
/// Steps never mutate a `State` in place. Every transition goes through
/// [`State::merge`] (or one of the counter helpers), which returns a new
/// instance. Fields are only ever overwritten or appended, never removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    values: serde_json::Map<String, Value>,
    seq: u64,
    error_counts: BTreeMap<String, u32>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field initializer for initial states.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The step-sequence number, incremented on every derived state.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Recorded failure count for a step in this run.
    pub fn error_count(&self, step: &str) -> u32 {
        self.error_counts.get(step).copied().unwrap_or(0)
    }

    pub fn error_counts(&self) -> &BTreeMap<String, u32> {
        &self.error_counts
    }

    /// All fields, in insertion order of first write.
    pub fn values(&self) -> &serde_json::Map<String, Value> {
        &self.values
    }

    /// Merge a step's partial update into this state, producing a new state
    /// with `seq + 1`. Keys absent from the update are preserved untouched,
    /// so re-merging the same update is idempotent for undeclared fields.
    pub fn merge(&self, update: &StateUpdate) -> State {
        let mut next = self.clone();
        for (k, v) in update.entries() {
            next.values.insert(k.clone(), v.clone());
        }
        next.seq += 1;
        next
    }

    /// Record one failed invocation of `step`.
    pub fn record_failure(&self, step: &str) -> State {
        let mut next = self.clone();
        *next.error_counts.entry(step.to_string()).or_insert(0) += 1;
        next.seq += 1;
        next
    }

    /// Reset the failure counter for a step after it succeeds.
    pub fn reset_failures(&self, step: &str) -> State {
        let mut next = self.clone();
        next.error_counts.remove(step);
        next
    }

    /// Carry failure counters and sequence forward onto a restored snapshot,
    /// so a rollback cannot refund retry budget or rewind the sequence.
    pub fn carry_progress_from(&self, newer: &State) -> State {
        let mut next = self.clone();
        next.error_counts = newer.error_counts.clone();
        next.seq = next.seq.max(newer.seq);
        next
    }
}

// ---------------------------------------------------------------------------
// StateUpdate: a step's declared partial write set
// ---------------------------------------------------------------------------

/// The partial update a step returns: only the fields it declares writing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    entries: serde_json::Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &serde_json::Map<String, Value> {
        &self.entries
    }
}

impl From<serde_json::Map<String, Value>> for StateUpdate {
    fn from(entries: serde_json::Map<String, Value>) -> Self {
        Self { entries }
    }
}

// ---------------------------------------------------------------------------
// StepError: one entry in a run's error trace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    /// 1-based attempt number at which this failure occurred.
    pub attempt: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StepError {
    pub fn new(step: impl Into<String>, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint: durable snapshot of state plus position
// ---------------------------------------------------------------------------

/// Immutable snapshot written after every successful merge and before every
/// suspension. `position` is the step that had just completed (or the gate
/// the run is parked at).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub seq: u64,
    pub position: String,
    pub status: RunStatus,
    pub state: State,
    pub error_trace: Vec<StepError>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        thread_id: ThreadId,
        position: impl Into<String>,
        status: RunStatus,
        state: State,
        error_trace: Vec<StepError>,
    ) -> Self {
        Self {
            thread_id,
            seq: state.seq(),
            position: position.into(),
            status,
            state,
            error_trace,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision: external input that releases a human gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Revise,
    Reject,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Revise => "revise",
            Verdict::Reject => "reject",
        }
    }
}

/// A decision record submitted to resume a suspended run. Carries an
/// optional verdict plus arbitrary structured fields, covering both the
/// binary approve/revise gate and richer review gates where the human edits
/// proposed state before execution proceeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Option<Verdict>,
    pub feedback: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            verdict: Some(Verdict::Approve),
            ..Default::default()
        }
    }

    pub fn reject() -> Self {
        Self {
            verdict: Some(Verdict::Reject),
            ..Default::default()
        }
    }

    pub fn revise(feedback: impl Into<String>) -> Self {
        Self {
            verdict: Some(Verdict::Revise),
            feedback: Some(feedback.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Express this decision as a state update: `approved`, `verdict`, and
    /// `feedback` first, then any free-form fields on top.
    pub fn fold_into_update(&self) -> StateUpdate {
        let mut update = StateUpdate::new();
        if let Some(v) = self.verdict {
            update = update
                .set("approved", Value::Bool(v == Verdict::Approve))
                .set("verdict", Value::String(v.as_str().to_string()));
        }
        if let Some(ref fb) = self.feedback {
            update = update.set("feedback", Value::String(fb.clone()));
        }
        for (k, v) in &self.fields {
            update = update.set(k.clone(), v.clone());
        }
        update
    }
}

// ---------------------------------------------------------------------------
// PendingDecision / FailureReport: the caller-visible run framings
// ---------------------------------------------------------------------------

/// What a caller receives when a run parks at a human gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub thread_id: ThreadId,
    /// Name of the gate step the run is suspended at.
    pub gate: String,
    /// Prompt text describing what is being asked of the external actor.
    pub prompt: String,
    /// Snapshot of the state at suspension, for display.
    pub state: State,
}

/// What a caller receives when recovery is exhausted: the cause plus the
/// full chain of attempted steps. Nothing is silently swallowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub thread_id: ThreadId,
    pub cause: String,
    pub trace: Vec<StepError>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- WorkflowError ---

    #[test]
    fn error_display_unknown_step() {
        let err = WorkflowError::UnknownStep {
            step: "missing".into(),
        };
        assert_eq!(err.to_string(), "Unknown step 'missing'");
    }

    #[test]
    fn error_display_routing() {
        let err = WorkflowError::RoutingError {
            step: "analyze".into(),
            message: "undeclared label 'maybe'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Routing error after step 'analyze': undeclared label 'maybe'"
        );
    }

    #[test]
    fn error_display_step_failure() {
        let err = WorkflowError::StepFailure {
            step: "load".into(),
            cause: "file missing".into(),
        };
        assert_eq!(err.to_string(), "Step 'load' failed: file missing");
    }

    #[test]
    fn error_display_upstream_timeout() {
        let err = WorkflowError::UpstreamTimeout {
            endpoint: "http://localhost:11434/v1".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(
            err.to_string(),
            "Upstream http://localhost:11434/v1 timed out after 30000ms"
        );
    }

    #[test]
    fn step_failure_is_retryable() {
        let err = WorkflowError::StepFailure {
            step: "s".into(),
            cause: "boom".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn upstream_errors_are_retryable() {
        assert!(WorkflowError::UpstreamUnavailable {
            endpoint: "e".into(),
            message: "down".into(),
        }
        .is_retryable());
        assert!(WorkflowError::UpstreamTimeout {
            endpoint: "e".into(),
            timeout_ms: 1,
        }
        .is_retryable());
    }

    #[test]
    fn construction_defects_are_fatal() {
        assert!(WorkflowError::UnknownStep { step: "s".into() }.is_fatal());
        assert!(WorkflowError::RoutingError {
            step: "s".into(),
            message: "m".into(),
        }
        .is_fatal());
        assert!(WorkflowError::ValidationError("bad".into()).is_fatal());
        assert!(!WorkflowError::NoCheckpoint { thread: "t".into() }.is_fatal());
    }

    #[test]
    fn from_io_and_json_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: WorkflowError = io.into();
        assert!(matches!(err, WorkflowError::Io(_)));

        let bad = serde_json::from_str::<Value>("not json").unwrap_err();
        let err: WorkflowError = bad.into();
        assert!(matches!(err, WorkflowError::Json(_)));
    }

    // --- ThreadId ---

    #[test]
    fn thread_id_round_trips_and_displays() {
        let id = ThreadId::new("doc-42");
        assert_eq!(id.as_str(), "doc-42");
        assert_eq!(id.to_string(), "doc-42");

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"doc-42\"");
        let back: ThreadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn random_thread_ids_are_distinct() {
        assert_ne!(ThreadId::random(), ThreadId::random());
    }

    // --- RunStatus ---

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::SuspendedForHuman.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn run_status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::SuspendedForHuman).unwrap(),
            "\"suspended_for_human\""
        );
    }

    // --- State / StateUpdate ---

    #[test]
    fn merge_produces_new_state_with_bumped_seq() {
        let base = State::new().with("doc", json!("raw text"));
        let update = StateUpdate::new().set("parsed", json!({"title": "T"}));

        let next = base.merge(&update);
        assert_eq!(next.seq(), base.seq() + 1);
        assert_eq!(next.get_str("doc"), Some("raw text"));
        assert_eq!(next.get("parsed"), Some(&json!({"title": "T"})));
        // Base is untouched.
        assert!(base.get("parsed").is_none());
    }

    #[test]
    fn merge_overwrites_declared_fields_only() {
        let base = State::new()
            .with("keep", json!("old"))
            .with("replace", json!("old"));
        let update = StateUpdate::new().set("replace", json!("new"));

        let next = base.merge(&update);
        assert_eq!(next.get_str("keep"), Some("old"));
        assert_eq!(next.get_str("replace"), Some("new"));
    }

    #[test]
    fn merging_same_update_twice_is_idempotent_for_undeclared_fields() {
        let base = State::new()
            .with("unrelated", json!(41))
            .with("counter", json!("stable"));
        let update = StateUpdate::new().set("result", json!("done"));

        let once = base.merge(&update);
        let twice = once.merge(&update);

        assert_eq!(twice.get("unrelated"), Some(&json!(41)));
        assert_eq!(twice.get_str("counter"), Some("stable"));
        assert_eq!(twice.get_str("result"), Some("done"));
    }

    #[test]
    fn record_and_reset_failures() {
        let s = State::new();
        let s = s.record_failure("load").record_failure("load");
        assert_eq!(s.error_count("load"), 2);
        assert_eq!(s.error_count("parse"), 0);

        let s = s.reset_failures("load");
        assert_eq!(s.error_count("load"), 0);
    }

    #[test]
    fn carry_progress_preserves_counters_and_seq() {
        let old = State::new().with("a", json!(1));
        let newer = old
            .merge(&StateUpdate::new().set("b", json!(2)))
            .record_failure("c")
            .record_failure("c");

        let restored = old.carry_progress_from(&newer);
        assert_eq!(restored.error_count("c"), 2);
        assert_eq!(restored.seq(), newer.seq());
        // Field writes made after the snapshot are discarded.
        assert!(restored.get("b").is_none());
        assert_eq!(restored.get("a"), Some(&json!(1)));
    }

    #[test]
    fn state_serde_round_trip() {
        let s = State::new()
            .with("doc", json!("text"))
            .record_failure("load");
        let json = serde_json::to_string(&s).unwrap();
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get_str("doc"), Some("text"));
        assert_eq!(back.error_count("load"), 1);
        assert_eq!(back.seq(), s.seq());
    }

    // --- Decision ---

    #[test]
    fn approve_decision_folds_to_approved_true() {
        let update = Decision::approve().fold_into_update();
        let state = State::new().merge(&update);
        assert_eq!(state.get_bool("approved"), Some(true));
        assert_eq!(state.get_str("verdict"), Some("approve"));
    }

    #[test]
    fn revise_decision_carries_feedback() {
        let update = Decision::revise("section 2 is wrong").fold_into_update();
        let state = State::new().merge(&update);
        assert_eq!(state.get_bool("approved"), Some(false));
        assert_eq!(state.get_str("verdict"), Some("revise"));
        assert_eq!(state.get_str("feedback"), Some("section 2 is wrong"));
    }

    #[test]
    fn decision_free_form_fields_are_merged() {
        let update = Decision::approve()
            .with_field("mapping", json!({"old": "new"}))
            .fold_into_update();
        let state = State::new().merge(&update);
        assert_eq!(state.get("mapping"), Some(&json!({"old": "new"})));
        assert_eq!(state.get_bool("approved"), Some(true));
    }

    // --- Checkpoint ---

    #[test]
    fn checkpoint_records_state_seq_and_round_trips() {
        let state = State::new().with("k", json!("v")).merge(&StateUpdate::new());
        let cp = Checkpoint::new(
            ThreadId::new("t1"),
            "parse",
            RunStatus::Running,
            state.clone(),
            vec![StepError::new("load", 1, "transient")],
        );
        assert_eq!(cp.seq, state.seq());

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.position, "parse");
        assert_eq!(back.status, RunStatus::Running);
        assert_eq!(back.state.get_str("k"), Some("v"));
        assert_eq!(back.error_trace.len(), 1);
        assert_eq!(back.error_trace[0].step, "load");
    }
}
