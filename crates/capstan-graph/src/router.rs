//! Routing: static edges, conditional edges over declared label sets, and
//! the terminal `End` target.
//!
//! Conditional routing is the declared-label contract: the finite set of
//! labels a decision function may return is fixed at graph construction, and
//! a label outside that set is a `RoutingError` at run time, never a silent
//! fallback. Cycles are legal and are the mechanism for multi-turn loops;
//! bounding them is the decision function's job (the engine separately
//! bounds its own retry cycle).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use capstan_types::{Result, State, WorkflowError};

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Where execution goes after a step: another named step or the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Step(String),
    End,
}

impl Next {
    pub fn step(name: impl Into<String>) -> Self {
        Next::Step(name.into())
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Next::Step(name) => Some(name),
            Next::End => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// A decision function evaluated against the current state. Must return one
/// of the labels declared for its edge.
pub type DecideFn = Arc<dyn Fn(&State) -> String + Send + Sync>;

/// The outgoing edge shape for one node.
pub enum Routing {
    /// Unconditional: ignores state, always one destination.
    Static(Next),
    /// Destination chosen from a declared finite label set.
    Conditional {
        decide: DecideFn,
        branches: HashMap<String, Next>,
    },
}

impl fmt::Debug for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routing::Static(next) => f.debug_tuple("Static").field(next).finish(),
            Routing::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("branches", branches)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Immutable map from step name to its routing, shared across runs.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<String, Routing>,
}

impl Router {
    pub(crate) fn new(routes: HashMap<String, Routing>) -> Self {
        Self { routes }
    }

    pub fn has_route(&self, step: &str) -> bool {
        self.routes.contains_key(step)
    }

    pub(crate) fn routes(&self) -> &HashMap<String, Routing> {
        &self.routes
    }

    /// Resolve the next target after `current`, evaluating any decision
    /// function against `state`.
    pub fn next(&self, current: &str, state: &State) -> Result<Next> {
        match self.routes.get(current) {
            None => Err(WorkflowError::RoutingError {
                step: current.to_string(),
                message: "no outgoing edge declared".into(),
            }),
            Some(Routing::Static(next)) => Ok(next.clone()),
            Some(Routing::Conditional { decide, branches }) => {
                let label = decide(state);
                branches
                    .get(&label)
                    .cloned()
                    .ok_or_else(|| WorkflowError::RoutingError {
                        step: current.to_string(),
                        message: format!("decision function returned undeclared label '{label}'"),
                    })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
