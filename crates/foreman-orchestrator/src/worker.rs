//! Worker abstraction and the static capability registry.
//!
//! Workers are the unreliable outer edge of the system: short-lived calls
//! that may fail, hang, or return garbage. Everything the orchestrator
//! needs from one is behind the [`Worker`] trait, so tests substitute
//! scripted doubles and production wires in real backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use foreman_core::types::{Capability, FailureSignature, Strategy};

// ---------------------------------------------------------------------------
// Requests and outputs
// ---------------------------------------------------------------------------

/// A condensed view of one earlier attempt, passed along so a worker can
/// avoid repeating what already failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptContext {
    pub strategy: Strategy,
    pub signature: Option<FailureSignature>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub subtask_id: Uuid,
    pub description: String,
    pub capability: Capability,
    /// The strategy this attempt should take. Retries arrive with a
    /// different strategy than the attempt that failed.
    pub strategy: Strategy,
    pub prior_attempts: Vec<AttemptContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub summary: String,
    pub files_touched: Vec<String>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Worker: Send + Sync {
    /// The admission-control key for the backend this worker calls.
    /// Workers sharing a backend should share a key so its failures are
    /// counted against one circuit.
    fn service_key(&self) -> &str;

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput, WorkerError>;
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability already registered: {0}")]
    DuplicateCapability(Capability),
}

struct Registration {
    worker: Arc<dyn Worker>,
    slots: usize,
}

/// Static mapping from capability to worker. Registration happens once at
/// startup; there is no runtime discovery and no fallback chain. A lookup
/// miss means the deployment is missing a worker, which the orchestrator
/// reports before dispatching anything.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<Capability, Registration>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker for a capability with the number of subtasks it
    /// can run at once.
    pub fn register(
        &mut self,
        capability: Capability,
        worker: Arc<dyn Worker>,
        slots: usize,
    ) -> Result<(), RegistryError> {
        if self.workers.contains_key(&capability) {
            return Err(RegistryError::DuplicateCapability(capability));
        }
        debug!(%capability, service_key = worker.service_key(), slots, "registered worker");
        self.workers.insert(
            capability,
            Registration {
                worker,
                slots: slots.max(1),
            },
        );
        Ok(())
    }

    pub fn worker_for(&self, capability: Capability) -> Option<Arc<dyn Worker>> {
        self.workers
            .get(&capability)
            .map(|registration| Arc::clone(&registration.worker))
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities: Vec<Capability> = self.workers.keys().copied().collect();
        capabilities.sort();
        capabilities
    }

    /// Total concurrent slots across all registered workers. The default
    /// dispatch parallelism when the config does not pin one.
    pub fn total_slots(&self) -> usize {
        self.workers
            .values()
            .map(|registration| registration.slots)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
