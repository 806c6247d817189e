//! Graph construction for the Capstan workflow engine: the step registry,
//! the router with its declared-label contract, and the builder that
//! validates all wiring before anything runs.

pub mod builder;
pub mod router;
pub mod step;

pub use builder::{Gate, Graph, GraphBuilder};
pub use router::{DecideFn, Next, Router, Routing};
pub use step::{step_fn, FnStep, Step, StepRegistry};
