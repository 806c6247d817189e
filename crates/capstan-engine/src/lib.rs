//! Capstan execution engine.
//!
//! Drives compiled workflow graphs: step invocation with bounded retries,
//! rollback to the last successful checkpoint, human-gate suspend/resume,
//! and an append-only checkpoint store with in-memory and on-disk backings.

pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod retry;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{Engine, EngineConfig, ErrorPolicy, RunOutcome};
pub use events::{EventEmitter, WorkflowEvent};
pub use retry::BackoffPolicy;
