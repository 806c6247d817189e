//! Run progress notifications.
//!
//! The engine publishes a [`WorkflowEvent`] for every lifecycle transition
//! over a [`tokio::sync::broadcast`] channel. Loggers, progress displays,
//! and tests can watch a run this way without reaching into engine state.

use serde::{Deserialize, Serialize};

use capstan_types::RunStatus;

/// What just happened inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    RunStarted {
        thread_id: String,
        entry: String,
    },
    StepStarted {
        thread_id: String,
        step: String,
    },
    StepCompleted {
        thread_id: String,
        step: String,
        seq: u64,
    },
    StepFailed {
        thread_id: String,
        step: String,
        attempt: u32,
        cause: String,
    },
    StepRetrying {
        thread_id: String,
        step: String,
        attempt: u32,
    },
    RolledBack {
        thread_id: String,
        to_position: String,
    },
    CheckpointSaved {
        thread_id: String,
        position: String,
        seq: u64,
    },
    RunSuspended {
        thread_id: String,
        gate: String,
    },
    RunResumed {
        thread_id: String,
        gate: String,
    },
    RunFinished {
        thread_id: String,
        status: RunStatus,
    },
}

/// Hands events to whoever is subscribed at the moment of emission.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// An emitter whose channel buffers up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast one event. A send with no live receivers is not an error;
    /// the event is simply discarded.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    /// Open a new receiver on the event channel.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(WorkflowEvent::RunStarted {
            thread_id: "t1".into(),
            entry: "load".into(),
        });

        match rx.recv().await.unwrap() {
            WorkflowEvent::RunStarted { thread_id, entry } => {
                assert_eq!(thread_id, "t1");
                assert_eq!(entry, "load");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(WorkflowEvent::CheckpointSaved {
            thread_id: "t1".into(),
            position: "parse".into(),
            seq: 2,
        });

        let e1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let e2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(e1, e2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(WorkflowEvent::RunFinished {
            thread_id: "t1".into(),
            status: RunStatus::Failed,
        });
    }
}
