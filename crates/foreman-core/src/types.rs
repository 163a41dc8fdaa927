use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::SubtaskGraph;

// ---------------------------------------------------------------------------
// ComplexityTier / ExecutionPattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Atomic,
    Simple,
    Moderate,
    Complex,
    Enterprise,
}

/// Shape of the subtask graph a tier decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    /// One implementation subtask, no validation.
    Single,
    /// Implementation followed by a dependent validation subtask.
    Pipeline,
    /// Planning, N parallel implementation subtasks, then one validation
    /// subtask gated on all of them.
    ForkJoin,
}

impl ComplexityTier {
    pub fn pattern(&self) -> ExecutionPattern {
        match self {
            ComplexityTier::Atomic | ComplexityTier::Simple => ExecutionPattern::Single,
            ComplexityTier::Moderate => ExecutionPattern::Pipeline,
            ComplexityTier::Complex | ComplexityTier::Enterprise => ExecutionPattern::ForkJoin,
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComplexityTier::Atomic => "atomic",
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
            ComplexityTier::Enterprise => "enterprise",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// The closed set of worker capabilities subtasks can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Plan,
    Implement,
    Validate,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Plan => "plan",
            Capability::Implement => "implement",
            Capability::Validate => "validate",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// SubtaskStatus / Subtask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl SubtaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `running -> ready` is the retry requeue after a failed attempt that
    /// still has strategies left.
    pub fn can_transition_to(&self, target: &SubtaskStatus) -> bool {
        matches!(
            (self, target),
            (SubtaskStatus::Pending, SubtaskStatus::Ready)
                | (SubtaskStatus::Pending, SubtaskStatus::Skipped)
                | (SubtaskStatus::Ready, SubtaskStatus::Running)
                | (SubtaskStatus::Ready, SubtaskStatus::Skipped)
                | (SubtaskStatus::Running, SubtaskStatus::Succeeded)
                | (SubtaskStatus::Running, SubtaskStatus::Failed)
                | (SubtaskStatus::Running, SubtaskStatus::Ready)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Succeeded | SubtaskStatus::Failed | SubtaskStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub capability: Capability,
    pub depends_on: Vec<Uuid>,
    pub status: SubtaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(task_id: Uuid, description: impl Into<String>, capability: Capability) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            description: description.into(),
            capability,
            depends_on: Vec::new(),
            status: SubtaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.depends_on = deps;
        self
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How a subtask attempt approaches the work. Retries escalate through
/// these rather than repeating a strategy that already failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Do the work as described.
    Direct,
    /// Apply the smallest targeted fix to the previous attempt's output.
    MechanicalFix,
    /// Discard prior output and produce it again from scratch.
    Regenerate,
    /// Reduce the ambition of the work to something that can land.
    Simplify,
}

impl Strategy {
    /// The default escalation order.
    pub fn default_order() -> &'static [Strategy] {
        &[
            Strategy::Direct,
            Strategy::MechanicalFix,
            Strategy::Regenerate,
            Strategy::Simplify,
        ]
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Direct => "direct",
            Strategy::MechanicalFix => "mechanical_fix",
            Strategy::Regenerate => "regenerate",
            Strategy::Simplify => "simplify",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// FailureSignature
// ---------------------------------------------------------------------------

/// Classification of a failed attempt, derived from its error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignature {
    MissingCurrentState,
    VagueRequirements,
    SyntaxError,
    TestFailure,
    Timeout,
    Unknown,
}

impl std::fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureSignature::MissingCurrentState => "missing_current_state",
            FailureSignature::VagueRequirements => "vague_requirements",
            FailureSignature::SyntaxError => "syntax_error",
            FailureSignature::TestFailure => "test_failure",
            FailureSignature::Timeout => "timeout",
            FailureSignature::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// AgentAttempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One completed worker call. Attempts are append-only history: they are
/// recorded once, after the call finishes, and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAttempt {
    pub subtask_id: Uuid,
    /// 1-based ordinal among all attempts for this subtask.
    pub attempt: u32,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Set during recording by failure classification; `None` on success.
    pub signature: Option<FailureSignature>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub files_touched: Vec<String>,
}

impl AgentAttempt {
    pub fn success(
        subtask_id: Uuid,
        attempt: u32,
        strategy: Strategy,
        started_at: DateTime<Utc>,
        output: impl Into<String>,
        files_touched: Vec<String>,
    ) -> Self {
        Self {
            subtask_id,
            attempt,
            strategy,
            started_at,
            completed_at: Utc::now(),
            outcome: AttemptOutcome::Success,
            signature: None,
            output: Some(output.into()),
            error: None,
            files_touched,
        }
    }

    pub fn failure(
        subtask_id: Uuid,
        attempt: u32,
        strategy: Strategy,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            subtask_id,
            attempt,
            strategy,
            started_at,
            completed_at: Utc::now(),
            outcome: AttemptOutcome::Failure,
            signature: None,
            output: None,
            error: Some(error.into()),
            files_touched: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == AttemptOutcome::Failure
    }
}

// ---------------------------------------------------------------------------
// TaskStage / StageTransition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Submitted,
    Routing,
    Implementing,
    Reviewing,
    Testing,
    Complete,
    Failed,
    Escalated,
}

impl TaskStage {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (TaskStage::Submitted, TaskStage::Routing)
                | (TaskStage::Routing, TaskStage::Implementing)
                | (TaskStage::Implementing, TaskStage::Reviewing)
                | (TaskStage::Implementing, TaskStage::Testing)
                | (TaskStage::Implementing, TaskStage::Complete)
                | (TaskStage::Reviewing, TaskStage::Testing)
                | (TaskStage::Reviewing, TaskStage::Complete)
                | (TaskStage::Testing, TaskStage::Complete)
                // Any live stage can fail or escalate
                | (_, TaskStage::Failed)
                | (_, TaskStage::Escalated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStage::Complete | TaskStage::Failed | TaskStage::Escalated
        )
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStage::Submitted => "submitted",
            TaskStage::Routing => "routing",
            TaskStage::Implementing => "implementing",
            TaskStage::Reviewing => "reviewing",
            TaskStage::Testing => "testing",
            TaskStage::Complete => "complete",
            TaskStage::Failed => "failed",
            TaskStage::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

/// One recorded stage change. Transitions are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: TaskStage,
    pub to: TaskStage,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work as submitted. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    /// The submitter's complexity claim, if any. Classification takes
    /// the minimum of this and the heuristic result.
    pub declared_tier: Option<ComplexityTier>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            declared_tier: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_declared_tier(mut self, tier: ComplexityTier) -> Self {
        self.declared_tier = Some(tier);
        self
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// Everything known about one task's journey through the pipeline. This
/// is the unit of persistence: a snapshot of this struct is enough to
/// resume after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: Uuid,
    pub task: Task,
    pub stage: TaskStage,
    pub graph: SubtaskGraph,
    pub attempts: Vec<AgentAttempt>,
    pub transitions: Vec<StageTransition>,
    /// Cached failed-attempt count for the worst subtask, clamped to
    /// `max_retries`. The attempt list is authoritative.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Distinct failure signatures in first-seen order.
    pub failure_patterns: Vec<FailureSignature>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(task: Task, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task,
            stage: TaskStage::Submitted,
            graph: SubtaskGraph::new(),
            attempts: Vec::new(),
            transitions: Vec::new(),
            retry_count: 0,
            max_retries,
            failure_patterns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// All attempts for one subtask, in recorded order.
    pub fn attempts_for(&self, subtask_id: Uuid) -> Vec<&AgentAttempt> {
        self.attempts.iter().filter(|a| a.subtask_id == subtask_id).collect()
    }

    /// Number of attempts recorded for one subtask.
    pub fn attempt_count(&self, subtask_id: Uuid) -> u32 {
        self.attempts.iter().filter(|a| a.subtask_id == subtask_id).count() as u32
    }

    /// Number of failed attempts recorded for one subtask. This scan is
    /// the authoritative retry count.
    pub fn failed_attempt_count(&self, subtask_id: Uuid) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.subtask_id == subtask_id && a.is_failure())
            .count() as u32
    }

    /// Strategies already tried and failed for one subtask, in first-use
    /// order. Reconstructed by scanning the attempt list, never cached.
    pub fn tried_strategies(&self, subtask_id: Uuid) -> Vec<Strategy> {
        let mut tried = Vec::new();
        for attempt in &self.attempts {
            if attempt.subtask_id == subtask_id
                && attempt.is_failure()
                && !tried.contains(&attempt.strategy)
            {
                tried.push(attempt.strategy);
            }
        }
        tried
    }

    /// Union of files touched across all attempts, in first-seen order.
    pub fn files_touched(&self) -> Vec<String> {
        let mut files = Vec::new();
        for attempt in &self.attempts {
            for file in &attempt.files_touched {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }

    /// Union of files touched by successful attempts only.
    pub fn files_touched_successful(&self) -> Vec<String> {
        let mut files = Vec::new();
        for attempt in &self.attempts {
            if attempt.is_failure() {
                continue;
            }
            for file in &attempt.files_touched {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }
}
