use chrono::{DateTime, Utc};
use foreman_core::types::{AgentAttempt, AttemptOutcome, FailureSignature, PipelineState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EscalationRecord
// ---------------------------------------------------------------------------

/// Hand-off package for a task the pipeline could not finish.
///
/// Carries everything a human reviewer (or a follow-up research
/// workflow) needs: the original ask, the full ordered attempt history
/// with strategies and failure signatures, the files the attempts
/// touched, and a next-step hint derived from the dominant failure
/// pattern. The `Display` form is the human-readable report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub pipeline_id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub attempts: Vec<AgentAttempt>,
    /// Distinct failure signatures in first-seen order.
    pub signatures: Vec<FailureSignature>,
    pub files_touched: Vec<String>,
    pub hint: String,
    pub created_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn from_state(state: &PipelineState) -> Self {
        let hint = hint_for(dominant_signature(&state.attempts));
        Self {
            pipeline_id: state.id,
            task_id: state.task.id,
            description: state.task.description.clone(),
            attempts: state.attempts.clone(),
            signatures: state.failure_patterns.clone(),
            files_touched: state.files_touched(),
            hint,
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for EscalationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "escalation for task {} (pipeline {})",
            self.task_id, self.pipeline_id
        )?;
        writeln!(f, "description: {}", self.description)?;
        if !self.signatures.is_empty() {
            let sigs: Vec<String> = self.signatures.iter().map(|s| s.to_string()).collect();
            writeln!(f, "failure patterns: {}", sigs.join(", "))?;
        }
        if !self.files_touched.is_empty() {
            writeln!(f, "files touched: {}", self.files_touched.join(", "))?;
        }
        writeln!(f, "attempts ({}):", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(
                f,
                "  [{}] subtask {} via {}: ",
                attempt.attempt, attempt.subtask_id, attempt.strategy
            )?;
            match attempt.outcome {
                AttemptOutcome::Success => writeln!(f, "success")?,
                AttemptOutcome::Failure => {
                    let signature = attempt
                        .signature
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unclassified".to_string());
                    let error = attempt.error.as_deref().unwrap_or("no error recorded");
                    writeln!(f, "failure ({signature}): {error}")?;
                }
            }
        }
        write!(f, "suggested next step: {}", self.hint)
    }
}

// ---------------------------------------------------------------------------
// Hints
// ---------------------------------------------------------------------------

/// The most frequent signature across failed attempts. Ties go to the
/// one seen first.
fn dominant_signature(attempts: &[AgentAttempt]) -> Option<FailureSignature> {
    let mut counts: Vec<(FailureSignature, usize)> = Vec::new();
    for attempt in attempts {
        if let Some(signature) = attempt.signature {
            match counts.iter_mut().find(|(s, _)| *s == signature) {
                Some((_, n)) => *n += 1,
                None => counts.push((signature, 1)),
            }
        }
    }
    let mut best: Option<(FailureSignature, usize)> = None;
    for (signature, count) in counts {
        match best {
            Some((_, top)) if top >= count => {}
            _ => best = Some((signature, count)),
        }
    }
    best.map(|(signature, _)| signature)
}

fn hint_for(signature: Option<FailureSignature>) -> String {
    let hint = match signature {
        Some(FailureSignature::MissingCurrentState) => {
            "Capture the current state of the affected files and fold it into the \
             task description; attempts kept acting on stale or absent context."
        }
        Some(FailureSignature::VagueRequirements) => {
            "Tighten the task description; attempts failed because the requirements \
             were too ambiguous to act on."
        }
        Some(FailureSignature::SyntaxError) => {
            "Inspect the produced changes by hand; repeated syntax errors point at \
             malformed output rather than a wrong approach."
        }
        Some(FailureSignature::TestFailure) => {
            "Review the failing tests; the output is well-formed but does not behave \
             as required."
        }
        Some(FailureSignature::Timeout) => {
            "Split the work into smaller subtasks or raise the subtask timeout; \
             attempts are not finishing in time."
        }
        Some(FailureSignature::Unknown) | None => {
            "Walk the attempt history; no dominant failure pattern was detected."
        }
    };
    hint.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
