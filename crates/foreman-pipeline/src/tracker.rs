//! PipelineStateTracker -- owns the authoritative history of every
//! pipeline and decides what a failed subtask should try next.
//!
//! All retry accounting is derived by scanning the append-only attempt
//! list, so a tracker rebuilt from a snapshot reaches exactly the same
//! decisions as the one that wrote it. Running out of strategies is an
//! expected outcome here, not an error; the tracker only fails hard
//! when persisted state cannot be trusted.

use std::collections::HashMap;

use chrono::Utc;
use foreman_core::config::PipelineConfig;
use foreman_core::graph::{GraphError, SubtaskGraph};
use foreman_core::types::{
    AgentAttempt, PipelineState, StageTransition, Strategy, Subtask, SubtaskStatus, Task,
    TaskStage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::classify_failure;
use crate::escalation::EscalationRecord;
use crate::store::{PipelineStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(Uuid),

    #[error("illegal stage transition: {from} -> {to}")]
    InvalidTransition { from: TaskStage, to: TaskStage },

    /// Persisted history is unreadable or inconsistent. The task must
    /// be re-submitted fresh; guessing state would be worse.
    #[error("corrupt pipeline state: {0}")]
    CorruptState(String),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

// ---------------------------------------------------------------------------
// PipelineStateTracker
// ---------------------------------------------------------------------------

/// Tracks every live pipeline: stages, subtask statuses, attempts, and
/// the strategy-escalation position for each subtask.
///
/// Every mutation snapshots the pipeline through the configured
/// [`PipelineStore`], best-effort. Snapshot failures are logged and do
/// not fail the mutation; the in-memory state stays authoritative for
/// the life of the process.
pub struct PipelineStateTracker {
    pipelines: HashMap<Uuid, PipelineState>,
    store: Option<PipelineStore>,
    max_retries: u32,
    strategy_order: Vec<Strategy>,
}

impl PipelineStateTracker {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            pipelines: HashMap::new(),
            store: config.resolved_state_dir().map(PipelineStore::new),
            max_retries: config.max_retries,
            strategy_order: config.strategy_order.clone(),
        }
    }

    /// Replace the snapshot store (useful for testing).
    pub fn with_store(mut self, store: PipelineStore) -> Self {
        self.store = Some(store);
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open a pipeline for a freshly submitted task. The graph starts
    /// empty; routing installs it.
    pub fn create(&mut self, task: Task) -> Uuid {
        let state = PipelineState::new(task, self.max_retries);
        let id = state.id;
        info!(pipeline_id = %id, task_id = %state.task.id, "pipeline created");
        self.pipelines.insert(id, state);
        self.snapshot(id);
        id
    }

    pub fn state(&self, id: Uuid) -> Result<&PipelineState> {
        self.pipelines
            .get(&id)
            .ok_or(TrackerError::UnknownPipeline(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.pipelines.contains_key(&id)
    }

    /// Install the decomposed subtask graph. Rejects graphs that fail
    /// structural validation.
    pub fn install_graph(&mut self, id: Uuid, graph: SubtaskGraph) -> Result<()> {
        graph.validate()?;
        let state = self.get_mut(id)?;
        state.graph = graph;
        state.updated_at = Utc::now();
        self.snapshot(id);
        Ok(())
    }

    /// Move the pipeline to a new stage. A repeat of the current stage
    /// is a no-op; anything outside the legal transition table is an
    /// error. Every real change is appended to the transition log.
    pub fn set_stage(&mut self, id: Uuid, to: TaskStage) -> Result<()> {
        let state = self.get_mut(id)?;
        if state.stage == to {
            return Ok(());
        }
        if !state.stage.can_transition_to(&to) {
            return Err(TrackerError::InvalidTransition {
                from: state.stage,
                to,
            });
        }
        info!(pipeline_id = %id, from = %state.stage, to = %to, "stage changed");
        state.transitions.push(StageTransition {
            from: state.stage,
            to,
            at: Utc::now(),
        });
        state.stage = to;
        state.updated_at = Utc::now();
        self.snapshot(id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subtask status
    // -----------------------------------------------------------------------

    pub fn set_subtask_status(
        &mut self,
        id: Uuid,
        subtask_id: Uuid,
        status: SubtaskStatus,
    ) -> Result<()> {
        let state = self.get_mut(id)?;
        state.graph.set_status(subtask_id, status)?;
        state.updated_at = Utc::now();
        self.snapshot(id);
        Ok(())
    }

    /// Skip every non-terminal dependent of a terminally failed
    /// subtask. Returns the skipped ids.
    pub fn skip_descendants(&mut self, id: Uuid, of: Uuid) -> Result<Vec<Uuid>> {
        let state = self.get_mut(id)?;
        let skipped = state.graph.skip_descendants(of);
        state.updated_at = Utc::now();
        self.snapshot(id);
        Ok(skipped)
    }

    /// Skip everything that has not started. Used by cancellation;
    /// running subtasks are left to finish.
    pub fn skip_unstarted(&mut self, id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.get_mut(id)?;
        let skipped = state.graph.skip_unstarted();
        state.updated_at = Utc::now();
        self.snapshot(id);
        Ok(skipped)
    }

    // -----------------------------------------------------------------------
    // Attempts and strategy escalation
    // -----------------------------------------------------------------------

    /// Append an attempt to the history. Failed attempts without a
    /// signature are classified from their error text, and the
    /// signature is folded into the pipeline's failure-pattern set.
    ///
    /// Attempt ordinals are unique per subtask, so re-delivery of an
    /// already recorded attempt is detected and ignored; retry
    /// accounting never double-counts one worker call.
    ///
    /// The retry ceiling is enforced here as a backstop: a failed
    /// attempt recorded past `max_retries` forces the pipeline to
    /// `escalated` rather than letting the loop continue.
    pub fn record_attempt(&mut self, id: Uuid, mut attempt: AgentAttempt) -> Result<()> {
        let state = self.get_mut(id)?;

        if state
            .attempts
            .iter()
            .any(|a| a.subtask_id == attempt.subtask_id && a.attempt == attempt.attempt)
        {
            debug!(
                pipeline_id = %id,
                subtask_id = %attempt.subtask_id,
                attempt = attempt.attempt,
                "attempt already recorded; replay ignored"
            );
            return Ok(());
        }

        if attempt.is_failure() && attempt.signature.is_none() {
            attempt.signature = Some(classify_failure(attempt.error.as_deref().unwrap_or("")));
        }
        if attempt.is_failure() {
            if let Some(signature) = attempt.signature {
                if !state.failure_patterns.contains(&signature) {
                    state.failure_patterns.push(signature);
                }
            }
        }

        let subtask_id = attempt.subtask_id;
        info!(
            pipeline_id = %id,
            subtask_id = %subtask_id,
            attempt = attempt.attempt,
            strategy = %attempt.strategy,
            failed = attempt.is_failure(),
            "attempt recorded"
        );
        state.attempts.push(attempt);

        let failed = state.failed_attempt_count(subtask_id);
        state.retry_count = state.retry_count.max(failed.min(state.max_retries));
        state.updated_at = Utc::now();

        if failed > state.max_retries && !state.stage.is_terminal() {
            warn!(
                pipeline_id = %id,
                subtask_id = %subtask_id,
                failed,
                max_retries = state.max_retries,
                "retry ceiling exceeded; forcing escalation"
            );
            state.transitions.push(StageTransition {
                from: state.stage,
                to: TaskStage::Escalated,
                at: Utc::now(),
            });
            state.stage = TaskStage::Escalated;
        }

        self.snapshot(id);
        Ok(())
    }

    /// Decide the next strategy for a subtask, or `None` when the
    /// pipeline should escalate instead.
    ///
    /// Strategies are consumed in the configured order, skipping any
    /// that already failed for this subtask. `None` means either the
    /// failed-attempt count reached `max_retries` or every strategy in
    /// the order has been tried. Both are expected terminal conditions,
    /// never errors.
    pub fn next_strategy(&self, id: Uuid, subtask_id: Uuid) -> Result<Option<Strategy>> {
        let state = self.state(id)?;
        if state.failed_attempt_count(subtask_id) >= state.max_retries {
            return Ok(None);
        }
        let tried = state.tried_strategies(subtask_id);
        Ok(self
            .strategy_order
            .iter()
            .copied()
            .find(|strategy| !tried.contains(strategy)))
    }

    // -----------------------------------------------------------------------
    // Terminal stages
    // -----------------------------------------------------------------------

    /// Move the pipeline to `escalated` and produce the hand-off
    /// record. The snapshot is archived; escalated pipelines are done
    /// as far as the orchestrator is concerned.
    pub fn escalate(&mut self, id: Uuid) -> Result<EscalationRecord> {
        let state = self.get_mut(id)?;
        if state.stage != TaskStage::Escalated {
            if !state.stage.can_transition_to(&TaskStage::Escalated) {
                return Err(TrackerError::InvalidTransition {
                    from: state.stage,
                    to: TaskStage::Escalated,
                });
            }
            state.transitions.push(StageTransition {
                from: state.stage,
                to: TaskStage::Escalated,
                at: Utc::now(),
            });
            state.stage = TaskStage::Escalated;
        }
        state.updated_at = Utc::now();
        let record = EscalationRecord::from_state(state);
        info!(
            pipeline_id = %id,
            attempts = record.attempts.len(),
            "pipeline escalated"
        );
        self.snapshot(id);
        self.archive_snapshot(id);
        Ok(record)
    }

    pub fn complete(&mut self, id: Uuid) -> Result<()> {
        self.set_stage(id, TaskStage::Complete)?;
        self.archive_snapshot(id);
        Ok(())
    }

    pub fn fail(&mut self, id: Uuid) -> Result<()> {
        self.set_stage(id, TaskStage::Failed)?;
        self.archive_snapshot(id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Restore a pipeline from its snapshot and pick up where it left
    /// off. Subtasks caught mid-dispatch by the crash carry `running`
    /// with no recorded outcome; they are requeued to `ready` so the
    /// same strategy is retried without burning an attempt.
    ///
    /// A missing snapshot is `UnknownPipeline`; one that is unreadable
    /// or breaks an invariant is `CorruptState` and the task has to be
    /// re-submitted fresh.
    pub fn resume(&mut self, id: Uuid) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or(TrackerError::UnknownPipeline(id))?;
        let mut state = match store.load(&id) {
            Ok(Some(state)) => state,
            Ok(None) => return Err(TrackerError::UnknownPipeline(id)),
            Err(StoreError::Corrupt { detail, .. }) => {
                return Err(TrackerError::CorruptState(detail))
            }
            Err(other) => return Err(TrackerError::Store(other)),
        };

        if state.id != id {
            return Err(TrackerError::CorruptState(format!(
                "snapshot holds pipeline {}, expected {}",
                state.id, id
            )));
        }
        state
            .graph
            .validate()
            .map_err(|e| TrackerError::CorruptState(e.to_string()))?;
        if state.retry_count > state.max_retries {
            return Err(TrackerError::CorruptState(format!(
                "retry count {} exceeds ceiling {}",
                state.retry_count, state.max_retries
            )));
        }
        for attempt in &state.attempts {
            if state.graph.get(attempt.subtask_id).is_none() {
                return Err(TrackerError::CorruptState(format!(
                    "attempt references unknown subtask {}",
                    attempt.subtask_id
                )));
            }
        }

        for running in state.graph.ids_with_status(SubtaskStatus::Running) {
            state
                .graph
                .set_status(running, SubtaskStatus::Ready)
                .map_err(|e| TrackerError::CorruptState(e.to_string()))?;
        }

        info!(pipeline_id = %id, stage = %state.stage, "pipeline resumed from snapshot");
        self.pipelines.insert(id, state);
        self.snapshot(id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn get_mut(&mut self, id: Uuid) -> Result<&mut PipelineState> {
        self.pipelines
            .get_mut(&id)
            .ok_or(TrackerError::UnknownPipeline(id))
    }

    fn snapshot(&self, id: Uuid) {
        if let (Some(store), Some(state)) = (self.store.as_ref(), self.pipelines.get(&id)) {
            if let Err(e) = store.save(state) {
                warn!(pipeline_id = %id, error = %e, "pipeline snapshot failed");
            }
        }
    }

    fn archive_snapshot(&self, id: Uuid) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.archive(&id) {
                warn!(pipeline_id = %id, error = %e, "pipeline archive failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
