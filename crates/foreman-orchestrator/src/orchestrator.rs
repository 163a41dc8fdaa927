//! The orchestrator: submit a task, run its subtask graph through
//! unreliable workers, and hand back exactly one terminal verdict.
//!
//! Worker failures, admission refusals, and timeouts are absorbed into
//! retry bookkeeping and ultimately into the verdict. The error side of
//! the public surface is reserved for problems with the request itself:
//! an invalid submission, an unknown or corrupt pipeline, a deployment
//! with no worker for a required capability.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_core::config::{ForemanConfig, OrchestratorConfig};
use foreman_core::events::{EventBus, OrchestratorEvent};
use foreman_core::graph::GraphError;
use foreman_core::types::{
    AgentAttempt, Capability, PipelineState, Strategy, SubtaskStatus, Task, TaskStage,
};
use foreman_governor::backoff::Backoff;
use foreman_governor::circuit_breaker::CircuitBreakerConfig;
use foreman_governor::governor::ResilienceGovernor;
use foreman_governor::rate_limiter::RateLimitConfig;
use foreman_pipeline::classify::classify_failure;
use foreman_pipeline::escalation::EscalationRecord;
use foreman_pipeline::tracker::{PipelineStateTracker, TrackerError};
use foreman_telemetry::metrics::MetricsRegistry;

use crate::cancel::CancelHandle;
use crate::decompose;
use crate::worker::{AttemptContext, Worker, WorkerRegistry, WorkerRequest};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The submission was rejected at the door; nothing was recorded.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(Uuid),
    /// The deployment has no worker for a capability the graph needs.
    /// Reported before the first dispatch, never halfway through.
    #[error("no worker registered for capability: {0}")]
    NoWorker(Capability),
    /// A snapshot exists but cannot be trusted. Never silently repaired.
    #[error("corrupt pipeline state: {0}")]
    CorruptState(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TrackerError> for OrchestratorError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::UnknownPipeline(id) => OrchestratorError::UnknownPipeline(id),
            TrackerError::CorruptState(detail) => OrchestratorError::CorruptState(detail),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<GraphError> for OrchestratorError {
    fn from(err: GraphError) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// The terminal answer for one pipeline. Every pipeline that starts
/// executing ends in exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Every subtask on the critical path succeeded. `degraded` lists
    /// subtasks that failed terminally without blocking anything that
    /// depended on them.
    Complete {
        pipeline_id: Uuid,
        files_touched: Vec<String>,
        degraded: Vec<Uuid>,
    },
    Failed {
        pipeline_id: Uuid,
        reason: String,
    },
    /// Retries were exhausted on the critical path. The record carries
    /// the full attempt history for a human to pick up.
    Escalated {
        pipeline_id: Uuid,
        record: EscalationRecord,
    },
}

// ---------------------------------------------------------------------------
// OrchestratorContext
// ---------------------------------------------------------------------------

/// Shared services, constructed by the caller and passed in. Keeping
/// these out of process globals lets several orchestrators coexist in
/// one process and lets tests observe everything that happens.
#[derive(Clone, Default)]
pub struct OrchestratorContext {
    pub bus: EventBus,
    pub metrics: Arc<MetricsRegistry>,
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator {
    registry: Arc<WorkerRegistry>,
    governor: Arc<ResilienceGovernor>,
    tracker: Arc<Mutex<PipelineStateTracker>>,
    context: OrchestratorContext,
    config: OrchestratorConfig,
    backoff: Backoff,
    cancels: DashMap<Uuid, CancelHandle>,
}

impl TaskOrchestrator {
    pub fn new(
        config: ForemanConfig,
        registry: Arc<WorkerRegistry>,
        context: OrchestratorContext,
    ) -> Self {
        let governor = ResilienceGovernor::new(
            CircuitBreakerConfig {
                failure_threshold: config.governor.failure_threshold,
                failure_window: config.governor.failure_window(),
                recovery_timeout: config.governor.recovery_timeout(),
            },
            RateLimitConfig::new(
                config.governor.bucket_capacity,
                config.governor.refill_per_minute,
            ),
        );
        let tracker = PipelineStateTracker::new(&config.pipeline);
        let backoff = Backoff::new(
            config.orchestrator.park_backoff_base(),
            config.orchestrator.park_backoff_cap(),
        );
        Self {
            registry,
            governor: Arc::new(governor),
            tracker: Arc::new(Mutex::new(tracker)),
            context,
            config: config.orchestrator,
            backoff,
            cancels: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Public surface
    // -----------------------------------------------------------------------

    /// Validate and admit a task. On success the task is recorded and a
    /// pipeline id comes back; [`execute`](Self::execute) runs it.
    pub async fn submit(&self, task: Task) -> Result<Uuid> {
        if task.description.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask(
                "description is empty".into(),
            ));
        }
        if task.description.len() > self.config.max_description_bytes {
            return Err(OrchestratorError::InvalidTask(format!(
                "description is {} bytes; the limit is {}",
                task.description.len(),
                self.config.max_description_bytes
            )));
        }

        let task_id = task.id;
        let pipeline_id = {
            let mut tracker = self.tracker.lock().await;
            tracker.create(task)
        };
        self.cancels.insert(pipeline_id, CancelHandle::new());
        self.context.metrics.increment_counter("tasks_submitted_total", &[]);
        self.context.metrics.add_gauge("pipelines_active", 1);
        self.context
            .bus
            .publish(OrchestratorEvent::TaskSubmitted { pipeline_id, task_id });
        info!(pipeline_id = %pipeline_id, task_id = %task_id, "task submitted");
        Ok(pipeline_id)
    }

    /// Drive a pipeline to its terminal verdict.
    ///
    /// Calling this on a pipeline that already finished returns the same
    /// verdict again without dispatching anything.
    pub async fn execute(&self, pipeline_id: Uuid) -> Result<Verdict> {
        let stage = {
            let tracker = self.tracker.lock().await;
            tracker.state(pipeline_id)?.stage
        };

        match stage {
            TaskStage::Submitted | TaskStage::Routing => self.route(pipeline_id).await?,
            TaskStage::Implementing | TaskStage::Reviewing | TaskStage::Testing => {
                // Resumed mid-flight; the graph is already installed.
            }
            TaskStage::Complete | TaskStage::Failed | TaskStage::Escalated => {
                return self.verdict_for_terminal(pipeline_id).await;
            }
        }

        // Every capability in the graph must have a worker before the
        // first dispatch. Finding out halfway through would strand work.
        {
            let tracker = self.tracker.lock().await;
            let state = tracker.state(pipeline_id)?;
            for capability in state.graph.capabilities() {
                if self.registry.worker_for(capability).is_none() {
                    return Err(OrchestratorError::NoWorker(capability));
                }
            }
        }

        self.run_dispatch_loop(pipeline_id).await
    }

    /// Request cancellation. Subtasks that have not started are skipped;
    /// in-flight worker calls run to completion and their outcomes are
    /// still recorded. The running `execute` returns a `Failed` verdict.
    pub async fn cancel(&self, pipeline_id: Uuid) -> Result<()> {
        let stage = {
            let tracker = self.tracker.lock().await;
            tracker.state(pipeline_id)?.stage
        };
        if stage.is_terminal() {
            return Ok(());
        }

        let handle = self.cancels.entry(pipeline_id).or_default().clone();
        if handle.trigger() {
            info!(pipeline_id = %pipeline_id, "cancellation requested");
            self.context.metrics.increment_counter("tasks_cancelled_total", &[]);
            self.context
                .bus
                .publish(OrchestratorEvent::TaskCancelled { pipeline_id });
        }
        Ok(())
    }

    /// Load a pipeline from its snapshot and run it to a verdict.
    ///
    /// Dispatches that were interrupted by the crash recorded no outcome,
    /// so the tracker requeues them and they retry at the same strategy
    /// position they held before.
    pub async fn resume(&self, pipeline_id: Uuid) -> Result<Verdict> {
        {
            let mut tracker = self.tracker.lock().await;
            if !tracker.contains(pipeline_id) {
                tracker.resume(pipeline_id)?;
                self.context.metrics.add_gauge("pipelines_active", 1);
                info!(pipeline_id = %pipeline_id, "pipeline restored from snapshot");
            }
        }
        self.cancels.entry(pipeline_id).or_default();
        self.execute(pipeline_id).await
    }

    /// A point-in-time copy of a pipeline's state, for inspection.
    pub async fn pipeline_state(&self, pipeline_id: Uuid) -> Result<PipelineState> {
        let tracker = self.tracker.lock().await;
        Ok(tracker.state(pipeline_id)?.clone())
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    async fn route(&self, pipeline_id: Uuid) -> Result<()> {
        let mut tracker = self.tracker.lock().await;
        let task = tracker.state(pipeline_id)?.task.clone();
        if tracker.state(pipeline_id)?.stage == TaskStage::Submitted {
            self.change_stage(&mut tracker, pipeline_id, TaskStage::Routing)?;
        }

        let tier = decompose::effective_tier(&task);
        let graph = decompose::decompose(&task, self.config.max_fanout)?;
        info!(
            pipeline_id = %pipeline_id,
            tier = %tier,
            subtasks = graph.len(),
            "task routed"
        );
        tracker.install_graph(pipeline_id, graph)?;
        self.change_stage(&mut tracker, pipeline_id, TaskStage::Implementing)?;
        Ok(())
    }

    fn change_stage(
        &self,
        tracker: &mut PipelineStateTracker,
        pipeline_id: Uuid,
        to: TaskStage,
    ) -> Result<()> {
        let from = tracker.state(pipeline_id)?.stage;
        if from == to {
            return Ok(());
        }
        tracker.set_stage(pipeline_id, to)?;
        self.context
            .bus
            .publish(OrchestratorEvent::StageChanged { pipeline_id, from, to });
        Ok(())
    }

    async fn verdict_for_terminal(&self, pipeline_id: Uuid) -> Result<Verdict> {
        let tracker = self.tracker.lock().await;
        let state = tracker.state(pipeline_id)?;
        let verdict = match state.stage {
            TaskStage::Complete => Verdict::Complete {
                pipeline_id,
                files_touched: state.files_touched_successful(),
                degraded: state.graph.ids_with_status(SubtaskStatus::Failed),
            },
            TaskStage::Escalated => Verdict::Escalated {
                pipeline_id,
                record: EscalationRecord::from_state(state),
            },
            _ => Verdict::Failed {
                pipeline_id,
                reason: "pipeline already failed".into(),
            },
        };
        Ok(verdict)
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn run_dispatch_loop(&self, pipeline_id: Uuid) -> Result<Verdict> {
        let cancel = self.cancels.entry(pipeline_id).or_default().clone();
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism()));
        let timeout = self.config.subtask_timeout();

        let mut join_set: JoinSet<DispatchResult> = JoinSet::new();
        let mut in_flight: HashSet<Uuid> = HashSet::new();
        let mut cancel_seen = false;
        let mut escalating = false;

        loop {
            // Cancellation bookkeeping runs once: skip what has not
            // started, then let in-flight calls finish.
            if cancel.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                self.skip_remaining(pipeline_id).await?;
            }

            if !cancel_seen && !escalating {
                self.spawn_ready(
                    pipeline_id,
                    &cancel,
                    &semaphore,
                    timeout,
                    &mut join_set,
                    &mut in_flight,
                )
                .await?;
            }

            let Some(joined) = join_set.join_next().await else {
                // Nothing running and nothing left to spawn.
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(pipeline_id = %pipeline_id, error = %join_error, "dispatch task aborted");
                    continue;
                }
            };
            in_flight.remove(&result.subtask_id);

            if result.outcome == DispatchOutcome::TerminalFailure {
                let (critical, skipped) = {
                    let mut tracker = self.tracker.lock().await;
                    // Dependents are checked before the skip cascade marks
                    // them terminal.
                    let has_dependents = tracker
                        .state(pipeline_id)?
                        .graph
                        .has_unfinished_dependents(result.subtask_id);
                    let skipped = tracker.skip_descendants(pipeline_id, result.subtask_id)?;
                    (has_dependents || self.config.strict_completion, skipped)
                };
                for subtask_id in skipped {
                    self.context
                        .bus
                        .publish(OrchestratorEvent::SubtaskSkipped { pipeline_id, subtask_id });
                }
                if critical && !escalating {
                    escalating = true;
                    debug!(
                        pipeline_id = %pipeline_id,
                        subtask_id = %result.subtask_id,
                        "critical subtask failed terminally; escalating after drain"
                    );
                }
            }
        }

        if cancel_seen {
            return self.finalize_cancelled(pipeline_id).await;
        }
        if escalating {
            return self.finalize_escalated(pipeline_id).await;
        }
        self.finalize_settled(pipeline_id).await
    }

    /// Promote subtasks whose dependencies finished and spawn a dispatch
    /// for each one that is not already in flight.
    async fn spawn_ready(
        &self,
        pipeline_id: Uuid,
        cancel: &CancelHandle,
        semaphore: &Arc<Semaphore>,
        timeout: Duration,
        join_set: &mut JoinSet<DispatchResult>,
        in_flight: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let candidates = {
            let mut tracker = self.tracker.lock().await;
            for subtask_id in tracker.state(pipeline_id)?.graph.ready_ids() {
                tracker.set_subtask_status(pipeline_id, subtask_id, SubtaskStatus::Ready)?;
            }
            let state = tracker.state(pipeline_id)?;
            state
                .graph
                .ids_with_status(SubtaskStatus::Ready)
                .into_iter()
                .filter(|id| !in_flight.contains(id))
                .filter_map(|id| {
                    state
                        .graph
                        .get(id)
                        .map(|subtask| (id, subtask.description.clone(), subtask.capability))
                })
                .collect::<Vec<_>>()
        };

        for (subtask_id, description, capability) in candidates {
            let next = {
                let tracker = self.tracker.lock().await;
                tracker.next_strategy(pipeline_id, subtask_id)?
            };
            let Some(strategy) = next else {
                // A requeued subtask with no strategies left: the crash
                // landed between recording its final failure and marking
                // it terminal. Close it out now.
                {
                    let mut tracker = self.tracker.lock().await;
                    tracker.set_subtask_status(pipeline_id, subtask_id, SubtaskStatus::Running)?;
                    tracker.set_subtask_status(pipeline_id, subtask_id, SubtaskStatus::Failed)?;
                }
                in_flight.insert(subtask_id);
                join_set.spawn(async move {
                    DispatchResult {
                        subtask_id,
                        outcome: DispatchOutcome::TerminalFailure,
                    }
                });
                continue;
            };

            let worker = self
                .registry
                .worker_for(capability)
                .ok_or(OrchestratorError::NoWorker(capability))?;
            let env = DispatchEnv {
                pipeline_id,
                tracker: Arc::clone(&self.tracker),
                governor: Arc::clone(&self.governor),
                context: self.context.clone(),
                cancel: cancel.clone(),
                semaphore: Arc::clone(semaphore),
                timeout,
                backoff: self.backoff,
            };
            in_flight.insert(subtask_id);
            join_set.spawn(dispatch_subtask(
                env,
                subtask_id,
                description,
                capability,
                strategy,
                worker,
            ));
        }
        Ok(())
    }

    async fn skip_remaining(&self, pipeline_id: Uuid) -> Result<()> {
        let skipped = {
            let mut tracker = self.tracker.lock().await;
            tracker.skip_unstarted(pipeline_id)?
        };
        for subtask_id in skipped {
            self.context
                .bus
                .publish(OrchestratorEvent::SubtaskSkipped { pipeline_id, subtask_id });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize_cancelled(&self, pipeline_id: Uuid) -> Result<Verdict> {
        // A failure between the cancel check and the requeue can leave a
        // subtask ready again; sweep once more before closing out.
        self.skip_remaining(pipeline_id).await?;

        let from = {
            let mut tracker = self.tracker.lock().await;
            let from = tracker.state(pipeline_id)?.stage;
            tracker.fail(pipeline_id)?;
            from
        };
        self.context.bus.publish(OrchestratorEvent::StageChanged {
            pipeline_id,
            from,
            to: TaskStage::Failed,
        });
        info!(pipeline_id = %pipeline_id, "pipeline cancelled");
        self.finish_pipeline(pipeline_id);
        Ok(Verdict::Failed {
            pipeline_id,
            reason: "cancelled".into(),
        })
    }

    async fn finalize_escalated(&self, pipeline_id: Uuid) -> Result<Verdict> {
        // Lanes that never started will never run now; settle them so the
        // record a human receives has no dangling subtasks.
        self.skip_remaining(pipeline_id).await?;

        let (from, record) = {
            let mut tracker = self.tracker.lock().await;
            let from = tracker.state(pipeline_id)?.stage;
            let record = tracker.escalate(pipeline_id)?;
            (from, record)
        };
        if from != TaskStage::Escalated {
            self.context.bus.publish(OrchestratorEvent::StageChanged {
                pipeline_id,
                from,
                to: TaskStage::Escalated,
            });
        }
        self.context.bus.publish(OrchestratorEvent::TaskEscalated {
            pipeline_id,
            task_id: record.task_id,
            attempts: record.attempts.len() as u32,
            signatures: record.signatures.clone(),
        });
        self.context.metrics.increment_counter("tasks_escalated_total", &[]);
        warn!(
            pipeline_id = %pipeline_id,
            attempts = record.attempts.len(),
            "task escalated to a human"
        );
        self.finish_pipeline(pipeline_id);
        Ok(Verdict::Escalated { pipeline_id, record })
    }

    async fn finalize_settled(&self, pipeline_id: Uuid) -> Result<Verdict> {
        let (task_id, files_touched, degraded, from) = {
            let tracker = self.tracker.lock().await;
            let state = tracker.state(pipeline_id)?;
            if !state.graph.is_settled() {
                return Err(OrchestratorError::Internal(
                    "dispatch loop exited with unsettled subtasks".into(),
                ));
            }
            (
                state.task.id,
                state.files_touched_successful(),
                state.graph.ids_with_status(SubtaskStatus::Failed),
                state.stage,
            )
        };

        {
            let mut tracker = self.tracker.lock().await;
            tracker.complete(pipeline_id)?;
        }
        self.context.bus.publish(OrchestratorEvent::StageChanged {
            pipeline_id,
            from,
            to: TaskStage::Complete,
        });
        self.context.bus.publish(OrchestratorEvent::ReadyForIntegration {
            pipeline_id,
            task_id,
            files_touched: files_touched.clone(),
        });
        self.context.metrics.increment_counter("tasks_completed_total", &[]);
        info!(
            pipeline_id = %pipeline_id,
            degraded = degraded.len(),
            "task complete"
        );
        self.finish_pipeline(pipeline_id);
        Ok(Verdict::Complete {
            pipeline_id,
            files_touched,
            degraded,
        })
    }

    fn finish_pipeline(&self, pipeline_id: Uuid) {
        self.cancels.remove(&pipeline_id);
        self.context.metrics.add_gauge("pipelines_active", -1);
    }

    fn max_parallelism(&self) -> usize {
        self.config
            .max_parallelism
            .unwrap_or_else(|| self.registry.total_slots())
            .max(1)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

struct DispatchEnv {
    pipeline_id: Uuid,
    tracker: Arc<Mutex<PipelineStateTracker>>,
    governor: Arc<ResilienceGovernor>,
    context: OrchestratorContext,
    cancel: CancelHandle,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Succeeded,
    /// Failed with strategies left; the subtask is ready again.
    Requeued,
    /// Failed with nothing left to try.
    TerminalFailure,
    /// Cancelled or skipped before the worker call started. No attempt
    /// was recorded.
    NotRun,
}

struct DispatchResult {
    subtask_id: Uuid,
    outcome: DispatchOutcome,
}

/// Run one attempt of one subtask: acquire a slot, clear admission,
/// call the worker under the timeout, record the outcome.
async fn dispatch_subtask(
    env: DispatchEnv,
    subtask_id: Uuid,
    description: String,
    capability: Capability,
    strategy: Strategy,
    worker: Arc<dyn Worker>,
) -> DispatchResult {
    let service_key = worker.service_key().to_string();
    let not_run = || DispatchResult {
        subtask_id,
        outcome: DispatchOutcome::NotRun,
    };

    // A slot is held only while actually running; parked callers give
    // theirs back so admitted work is never starved by waiting work.
    let mut park_retry: u32 = 0;
    let permit = loop {
        let Ok(permit) = Arc::clone(&env.semaphore).acquire_owned().await else {
            return not_run();
        };
        if env.cancel.is_cancelled() {
            return not_run();
        }
        if env.governor.admit(&service_key) {
            break permit;
        }
        drop(permit);

        let delay = env.backoff.delay_for(park_retry);
        park_retry = park_retry.saturating_add(1);
        debug!(
            subtask_id = %subtask_id,
            service_key = %service_key,
            retry_in_ms = delay.as_millis() as u64,
            "admission refused; parked"
        );
        env.context.metrics.increment_counter(
            "subtasks_parked_total",
            &[("service_key", service_key.as_str())],
        );
        env.context.bus.publish(OrchestratorEvent::SubtaskParked {
            pipeline_id: env.pipeline_id,
            subtask_id,
            service_key: service_key.clone(),
            retry_in_ms: delay.as_millis() as u64,
        });
        let mut cancelled = env.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled.recv() => return not_run(),
        }
    };

    // Mark running and collect the attempt context. The transition fails
    // only if the subtask was skipped while we were parked.
    let (attempt_number, prior_attempts) = {
        let mut tracker = env.tracker.lock().await;
        if tracker
            .set_subtask_status(env.pipeline_id, subtask_id, SubtaskStatus::Running)
            .is_err()
        {
            return not_run();
        }
        if capability == Capability::Validate {
            // Validation dispatching moves the pipeline into testing.
            advance_stage(&mut tracker, &env, TaskStage::Reviewing, TaskStage::Testing);
        }
        let Ok(state) = tracker.state(env.pipeline_id) else {
            return not_run();
        };
        let attempt_number = state.attempt_count(subtask_id) + 1;
        let prior_attempts: Vec<AttemptContext> = state
            .attempts_for(subtask_id)
            .into_iter()
            .map(|attempt| AttemptContext {
                strategy: attempt.strategy,
                signature: attempt.signature,
                error: attempt.error.clone(),
            })
            .collect();
        (attempt_number, prior_attempts)
    };

    let capability_label = capability.to_string();
    env.context.bus.publish(OrchestratorEvent::SubtaskDispatched {
        pipeline_id: env.pipeline_id,
        subtask_id,
        strategy,
        attempt: attempt_number,
    });
    env.context.metrics.increment_counter(
        "subtasks_dispatched_total",
        &[("capability", capability_label.as_str())],
    );
    env.context.metrics.add_gauge("subtasks_in_flight", 1);
    info!(
        subtask_id = %subtask_id,
        capability = %capability,
        strategy = %strategy,
        attempt = attempt_number,
        "dispatching subtask"
    );

    let request = WorkerRequest {
        subtask_id,
        description,
        capability,
        strategy,
        prior_attempts,
    };
    let started_at = Utc::now();
    let clock = Instant::now();
    let call = tokio::time::timeout(env.timeout, worker.execute(request)).await;

    let outcome = match call {
        Ok(Ok(output)) => {
            env.governor.record(&service_key, true);
            let attempt = AgentAttempt::success(
                subtask_id,
                attempt_number,
                strategy,
                started_at,
                output.summary,
                output.files_touched,
            );
            {
                let mut tracker = env.tracker.lock().await;
                if let Err(err) = tracker.record_attempt(env.pipeline_id, attempt) {
                    warn!(subtask_id = %subtask_id, error = %err, "failed to record attempt");
                }
                if let Err(err) =
                    tracker.set_subtask_status(env.pipeline_id, subtask_id, SubtaskStatus::Succeeded)
                {
                    warn!(subtask_id = %subtask_id, error = %err, "failed to mark subtask succeeded");
                }
                if capability == Capability::Implement && implementation_finished(&tracker, &env) {
                    // The last implementation lane landing moves a pattern
                    // with a validation phase into reviewing.
                    advance_stage(&mut tracker, &env, TaskStage::Implementing, TaskStage::Reviewing);
                }
            }
            env.context.bus.publish(OrchestratorEvent::SubtaskSucceeded {
                pipeline_id: env.pipeline_id,
                subtask_id,
            });
            env.context.metrics.increment_counter("subtasks_succeeded_total", &[]);
            DispatchOutcome::Succeeded
        }
        failed => {
            // A timeout is an ordinary failed attempt; the error text is
            // recognised by failure classification.
            let error = match failed {
                Ok(Err(worker_error)) => worker_error.message,
                _ => format!("worker call timed out after {}s", env.timeout.as_secs()),
            };
            env.governor.record(&service_key, false);
            let signature = classify_failure(&error);
            let signature_label = signature.to_string();
            warn!(
                subtask_id = %subtask_id,
                strategy = %strategy,
                signature = %signature,
                error = %error,
                "subtask attempt failed"
            );

            let attempt =
                AgentAttempt::failure(subtask_id, attempt_number, strategy, started_at, error);
            let (outcome, will_retry) = {
                let mut tracker = env.tracker.lock().await;
                if let Err(err) = tracker.record_attempt(env.pipeline_id, attempt) {
                    warn!(subtask_id = %subtask_id, error = %err, "failed to record attempt");
                }
                let next = match tracker.next_strategy(env.pipeline_id, subtask_id) {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(subtask_id = %subtask_id, error = %err, "strategy lookup failed");
                        None
                    }
                };
                match next {
                    Some(next_strategy) => {
                        debug!(
                            subtask_id = %subtask_id,
                            next_strategy = %next_strategy,
                            "requeueing with the next strategy"
                        );
                        match tracker.set_subtask_status(
                            env.pipeline_id,
                            subtask_id,
                            SubtaskStatus::Ready,
                        ) {
                            Ok(()) => (DispatchOutcome::Requeued, true),
                            Err(_) => (DispatchOutcome::TerminalFailure, false),
                        }
                    }
                    None => {
                        if let Err(err) = tracker.set_subtask_status(
                            env.pipeline_id,
                            subtask_id,
                            SubtaskStatus::Failed,
                        ) {
                            warn!(subtask_id = %subtask_id, error = %err, "failed to mark subtask failed");
                        }
                        (DispatchOutcome::TerminalFailure, false)
                    }
                }
            };
            env.context.bus.publish(OrchestratorEvent::SubtaskFailed {
                pipeline_id: env.pipeline_id,
                subtask_id,
                signature,
                attempt: attempt_number,
                will_retry,
            });
            env.context.metrics.increment_counter(
                "subtasks_failed_total",
                &[("signature", signature_label.as_str())],
            );
            outcome
        }
    };

    env.context
        .metrics
        .record_histogram("subtask_duration_seconds", clock.elapsed().as_secs_f64());
    env.context.metrics.add_gauge("subtasks_in_flight", -1);
    drop(permit);

    DispatchResult {
        subtask_id,
        outcome,
    }
}

/// True when the graph has a validation phase and every implementation
/// subtask has succeeded.
fn implementation_finished(tracker: &PipelineStateTracker, env: &DispatchEnv) -> bool {
    let Ok(state) = tracker.state(env.pipeline_id) else {
        return false;
    };
    let has_validation = state
        .graph
        .iter()
        .any(|subtask| subtask.capability == Capability::Validate);
    has_validation
        && state
            .graph
            .iter()
            .filter(|subtask| subtask.capability == Capability::Implement)
            .all(|subtask| subtask.status == SubtaskStatus::Succeeded)
}

/// Move the pipeline stage forward if it is currently at `from`. Stage
/// waypoints are cosmetic relative to subtask truth, so a miss here is
/// logged rather than propagated.
fn advance_stage(
    tracker: &mut PipelineStateTracker,
    env: &DispatchEnv,
    from: TaskStage,
    to: TaskStage,
) {
    let at_from = tracker
        .state(env.pipeline_id)
        .map(|state| state.stage == from)
        .unwrap_or(false);
    if !at_from {
        return;
    }
    match tracker.set_stage(env.pipeline_id, to) {
        Ok(()) => {
            env.context.bus.publish(OrchestratorEvent::StageChanged {
                pipeline_id: env.pipeline_id,
                from,
                to,
            });
        }
        Err(err) => {
            debug!(pipeline_id = %env.pipeline_id, error = %err, "stage advance skipped");
        }
    }
}
