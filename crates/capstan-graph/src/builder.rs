//! Graph builder and upfront validation.
//!
//! All wiring defects (duplicate names, unknown edge targets, nodes with no
//! outgoing edge, undeclared branch destinations) are caught by
//! [`GraphBuilder::compile`] before a single step runs. The compiled
//! [`Graph`] is immutable, process-wide configuration shared safely across
//! concurrent runs.

use std::collections::HashMap;
use std::sync::Arc;

use capstan_types::{Result, State, StateUpdate, WorkflowError};

use crate::router::{DecideFn, Next, Router, Routing};
use crate::step::{Step, StepRegistry};

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// A node marked as a human gate. The engine never auto-invokes a step
/// function here; it suspends and surfaces `prompt` to the external actor.
#[derive(Debug, Clone)]
pub struct Gate {
    pub prompt: String,
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct GraphBuilder {
    registry: StepRegistry,
    gates: HashMap<String, Gate>,
    routes: HashMap<String, Routing>,
    entry: Option<String>,
    problems: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named step function.
    pub fn add_step(mut self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        let name = name.into();
        if self.gates.contains_key(&name) || !self.registry.register(name.clone(), step) {
            self.problems.push(format!("duplicate node name '{name}'"));
        }
        self
    }

    /// Register a human gate node with its decision prompt.
    pub fn add_gate(mut self, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let name = name.into();
        if self.registry.contains(&name) || self.gates.contains_key(&name) {
            self.problems.push(format!("duplicate node name '{name}'"));
        } else {
            self.gates.insert(
                name,
                Gate {
                    prompt: prompt.into(),
                },
            );
        }
        self
    }

    /// The node execution begins at.
    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Unconditional edge `from -> to`.
    pub fn add_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_route(from.into(), Routing::Static(Next::step(to)))
    }

    /// Unconditional edge `from -> END`.
    pub fn add_edge_to_end(self, from: impl Into<String>) -> Self {
        self.add_route(from.into(), Routing::Static(Next::End))
    }

    /// Conditional edge: `decide` is evaluated against the current state and
    /// must return one of the labels in `branches`; the full label set is
    /// declared here, at construction time.
    pub fn add_conditional<F, L>(
        self,
        from: impl Into<String>,
        decide: F,
        branches: impl IntoIterator<Item = (L, Next)>,
    ) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
        L: Into<String>,
    {
        let branches: HashMap<String, Next> = branches
            .into_iter()
            .map(|(label, next)| (label.into(), next))
            .collect();
        self.add_route(
            from.into(),
            Routing::Conditional {
                decide: Arc::new(decide) as DecideFn,
                branches,
            },
        )
    }

    fn add_route(mut self, from: String, routing: Routing) -> Self {
        if self.routes.contains_key(&from) {
            self.problems
                .push(format!("node '{from}' already has an outgoing edge"));
        } else {
            self.routes.insert(from, routing);
        }
        self
    }

    /// Validate the wiring and freeze the graph.
    pub fn compile(self) -> Result<Graph> {
        let mut problems = self.problems;
        let known = |name: &str| self.registry.contains(name) || self.gates.contains_key(name);

        let entry = match &self.entry {
            None => {
                problems.push("no entry step set".into());
                String::new()
            }
            Some(name) if !known(name) => {
                problems.push(format!("entry step '{name}' is not registered"));
                name.clone()
            }
            Some(name) => name.clone(),
        };

        for (from, routing) in &self.routes {
            if !known(from) {
                problems.push(format!("edge declared from unregistered node '{from}'"));
            }
            match routing {
                Routing::Static(Next::Step(to)) if !known(to) => {
                    problems.push(format!("edge '{from}' -> '{to}' targets an unregistered node"));
                }
                Routing::Conditional { branches, .. } => {
                    if branches.is_empty() {
                        problems.push(format!("conditional edge from '{from}' declares no labels"));
                    }
                    for (label, next) in branches {
                        if let Next::Step(to) = next {
                            if !known(to) {
                                problems.push(format!(
                                    "branch '{label}' of '{from}' targets unregistered node '{to}'"
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Every node needs a way out; a run that reaches a route-less node
        // would die with a RoutingError mid-flight.
        for name in self
            .registry
            .names()
            .map(String::from)
            .chain(self.gates.keys().cloned())
        {
            if !self.routes.contains_key(&name) {
                problems.push(format!("node '{name}' has no outgoing edge"));
            }
        }

        if !problems.is_empty() {
            problems.sort();
            return Err(WorkflowError::ValidationError(problems.join("; ")));
        }

        tracing::debug!(
            steps = self.registry.names().count(),
            gates = self.gates.len(),
            entry = %entry,
            "graph compiled"
        );

        Ok(Graph {
            registry: self.registry,
            router: Router::new(self.routes),
            gates: self.gates,
            entry,
        })
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A compiled, immutable workflow graph.
pub struct Graph {
    registry: StepRegistry,
    router: Router,
    gates: HashMap<String, Gate>,
    entry: String,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn is_gate(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    pub fn gate(&self, name: &str) -> Option<&Gate> {
        self.gates.get(name)
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Invoke a step by name against a state snapshot.
    pub async fn invoke(&self, name: &str, state: State) -> Result<StateUpdate> {
        self.registry.invoke(name, state).await
    }

    /// Resolve the next target after `current`.
    pub fn next(&self, current: &str, state: &State) -> Result<Next> {
        self.router.next(current, state)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("entry", &self.entry)
            .field("steps", &self.registry.names().collect::<Vec<_>>())
            .field("gates", &self.gates.keys().collect::<Vec<_>>())
            .field("routes", &self.router.routes().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
