use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{FailureSignature, Strategy, TaskStage};

// ---------------------------------------------------------------------------
// OrchestratorEvent
// ---------------------------------------------------------------------------

/// Everything observable about a pipeline while it runs. Subscribers get
/// clones; a slow or dropped subscriber never blocks the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskSubmitted {
        pipeline_id: Uuid,
        task_id: Uuid,
    },
    StageChanged {
        pipeline_id: Uuid,
        from: TaskStage,
        to: TaskStage,
    },
    SubtaskDispatched {
        pipeline_id: Uuid,
        subtask_id: Uuid,
        strategy: Strategy,
        attempt: u32,
    },
    /// Admission was refused; the subtask will retry after the delay.
    /// Parking is not an attempt and never increments retry counts.
    SubtaskParked {
        pipeline_id: Uuid,
        subtask_id: Uuid,
        service_key: String,
        retry_in_ms: u64,
    },
    SubtaskSucceeded {
        pipeline_id: Uuid,
        subtask_id: Uuid,
    },
    SubtaskFailed {
        pipeline_id: Uuid,
        subtask_id: Uuid,
        signature: FailureSignature,
        attempt: u32,
        will_retry: bool,
    },
    SubtaskSkipped {
        pipeline_id: Uuid,
        subtask_id: Uuid,
    },
    ReadyForIntegration {
        pipeline_id: Uuid,
        task_id: Uuid,
        files_touched: Vec<String>,
    },
    TaskEscalated {
        pipeline_id: Uuid,
        task_id: Uuid,
        attempts: u32,
        signatures: Vec<FailureSignature>,
    },
    TaskCancelled {
        pipeline_id: Uuid,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a new receiver that
/// will receive all events published after the subscription was created.
/// The bus is thread-safe and can be cloned cheaply.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<OrchestratorEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<OrchestratorEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// automatically pruned.
    pub fn publish(&self, event: OrchestratorEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
