//! Complexity routing: score a task description, pick a tier, and build
//! the subtask graph for that tier's execution pattern.
//!
//! Scoring reads structural signals only (enumerated sections, file-path
//! targets, concern keywords). No call leaves the process. When the
//! signals are ambiguous the classifier rounds down; a tier that is too
//! low costs one retry cycle, a tier that is too high fans out work that
//! did not need splitting.

use foreman_core::graph::{GraphError, SubtaskGraph};
use foreman_core::types::{Capability, ComplexityTier, ExecutionPattern, Subtask, Task};

// ---------------------------------------------------------------------------
// Signal extraction
// ---------------------------------------------------------------------------

/// Concern vocabulary for lane splitting. Matched against whole words,
/// so "tests" counts and "latest" does not.
const CONCERN_KEYWORDS: &[&str] = &[
    "api", "auth", "backend", "cache", "cli", "config", "database", "docs",
    "frontend", "logging", "metrics", "migration", "performance", "schema",
    "security", "tests", "ui",
];

/// Structural signals scraped from a task description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    /// Count of bulleted or numbered list lines.
    pub enumerated_sections: usize,
    /// Distinct file-path-looking tokens, first spelling kept.
    pub file_targets: Vec<String>,
    /// Distinct concern keywords in order of first appearance.
    pub concerns: Vec<String>,
}

pub fn extract_signals(description: &str) -> Signals {
    let enumerated_sections = description.lines().filter(|line| is_enumerated(line)).count();

    let mut file_targets = Vec::new();
    let mut seen_targets = std::collections::HashSet::new();
    for raw in description.split_whitespace() {
        let token = raw.trim_matches(|c: char| ".,;:!?()[]{}<>\"'`".contains(c));
        if is_path_like(token) && seen_targets.insert(token.to_ascii_lowercase()) {
            file_targets.push(token.to_string());
        }
    }

    let mut concerns = Vec::new();
    for word in description.split(|c: char| !c.is_ascii_alphanumeric()) {
        let word = word.to_ascii_lowercase();
        if CONCERN_KEYWORDS.contains(&word.as_str()) && !concerns.contains(&word) {
            concerns.push(word);
        }
    }

    Signals {
        enumerated_sections,
        file_targets,
        concerns,
    }
}

/// A bulleted line, or a numbered one like `1.` / `2)`. The marker must
/// end the token so "10.5% faster" does not count.
fn is_enumerated(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") {
        return true;
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = t[digits..].as_bytes();
    matches!(rest.first(), Some(b'.') | Some(b')')) && matches!(rest.get(1), None | Some(b' '))
}

/// A token naming a file: contains a path separator, or a stem of at
/// least two characters plus a short alphabetic extension. Bare version
/// numbers ("1.2") and abbreviations ("e.g") do not qualify.
fn is_path_like(token: &str) -> bool {
    if token.len() < 3 {
        return false;
    }
    if token.contains('/') {
        return token.chars().any(|c| c.is_ascii_alphanumeric());
    }
    let Some(dot) = token.rfind('.') else {
        return false;
    };
    if dot < 2 || dot + 1 == token.len() {
        return false;
    }
    let ext = &token[dot + 1..];
    ext.len() <= 5
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
        && ext.chars().any(|c| c.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map signals to a tier. Thresholds err toward the lower tier; the
/// heuristic never claims `Enterprise` because a description alone cannot
/// support it (both top tiers fan out identically anyway).
pub fn classify(description: &str) -> ComplexityTier {
    let signals = extract_signals(description);
    let words = description.split_whitespace().count();

    if signals.file_targets.len() >= 2
        || signals.enumerated_sections >= 4
        || signals.concerns.len() >= 3
    {
        ComplexityTier::Complex
    } else if signals.file_targets.len() == 1
        || signals.enumerated_sections >= 2
        || signals.concerns.len() == 2
    {
        ComplexityTier::Moderate
    } else if words >= 20 || signals.concerns.len() == 1 || signals.enumerated_sections == 1 {
        ComplexityTier::Simple
    } else {
        ComplexityTier::Atomic
    }
}

/// The tier a task is actually routed at: the minimum of the submitter's
/// declared tier and the heuristic result. A declaration can lower the
/// routing, never raise it.
pub fn effective_tier(task: &Task) -> ComplexityTier {
    let heuristic = classify(&task.description);
    match task.declared_tier {
        Some(declared) => declared.min(heuristic),
        None => heuristic,
    }
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the subtask graph for a task's effective tier.
///
/// - `Single`: one implementation subtask carrying the task description.
/// - `Pipeline`: implementation, then a dependent validation subtask.
/// - `ForkJoin`: one planning subtask, two to `max_fanout` implementation
///   lanes gated on the plan, then one validation subtask gated on every
///   lane. Lanes are named after file targets when the description has
///   them, concern keywords otherwise.
pub fn decompose(task: &Task, max_fanout: usize) -> Result<SubtaskGraph, GraphError> {
    let tier = effective_tier(task);
    let mut graph = SubtaskGraph::new();

    match tier.pattern() {
        ExecutionPattern::Single => {
            graph.add(Subtask::new(
                task.id,
                task.description.clone(),
                Capability::Implement,
            ))?;
        }
        ExecutionPattern::Pipeline => {
            let implement = Subtask::new(task.id, task.description.clone(), Capability::Implement);
            let implement_id = implement.id;
            graph.add(implement)?;
            graph.add(
                Subtask::new(
                    task.id,
                    format!("validate the changes for: {}", task.description),
                    Capability::Validate,
                )
                .with_dependencies(vec![implement_id]),
            )?;
        }
        ExecutionPattern::ForkJoin => {
            let plan = Subtask::new(
                task.id,
                format!("plan the approach for: {}", task.description),
                Capability::Plan,
            );
            let plan_id = plan.id;
            graph.add(plan)?;

            let mut lane_ids = Vec::new();
            for lane in fanout_lanes(&task.description, max_fanout) {
                let subtask = Subtask::new(
                    task.id,
                    format!("implement {lane} for: {}", task.description),
                    Capability::Implement,
                )
                .with_dependencies(vec![plan_id]);
                lane_ids.push(subtask.id);
                graph.add(subtask)?;
            }

            graph.add(
                Subtask::new(
                    task.id,
                    format!("validate the combined changes for: {}", task.description),
                    Capability::Validate,
                )
                .with_dependencies(lane_ids),
            )?;
        }
    }

    Ok(graph)
}

/// Lane labels for a fork-join split. The longer of the two signal lists
/// wins; plain prose falls back to two generic slices.
fn fanout_lanes(description: &str, max_fanout: usize) -> Vec<String> {
    let signals = extract_signals(description);
    let cap = max_fanout.max(2);

    let mut lanes = if signals.file_targets.len() >= signals.concerns.len() {
        signals.file_targets
    } else {
        signals.concerns
    };
    lanes.truncate(cap);

    if lanes.len() < 2 {
        lanes = (1..=2).map(|i| format!("slice {i} of 2")).collect();
    }
    lanes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_markers_are_recognised() {
        assert!(is_enumerated("- add a test"));
        assert!(is_enumerated("  * second point"));
        assert!(is_enumerated("1. first"));
        assert!(is_enumerated("12) twelfth"));
        assert!(!is_enumerated("10.5% faster than before"));
        assert!(!is_enumerated("plain prose line"));
        assert!(!is_enumerated("-dash without space"));
    }

    #[test]
    fn path_detection_rejects_near_misses() {
        assert!(is_path_like("src/auth.rs"));
        assert!(is_path_like("README.md"));
        assert!(is_path_like("api/users"));
        assert!(!is_path_like("e.g"));
        assert!(!is_path_like("1.2"));
        assert!(!is_path_like("10.5"));
        assert!(!is_path_like("README"));
        assert!(!is_path_like("trailing."));
    }

    #[test]
    fn concerns_match_whole_words_only() {
        let signals = extract_signals("improve the latest auth tests");
        assert_eq!(signals.concerns, vec!["auth", "tests"]);
    }

    #[test]
    fn file_targets_deduplicate_case_insensitively() {
        let signals = extract_signals("touch src/Main.rs and src/main.rs again");
        assert_eq!(signals.file_targets, vec!["src/Main.rs"]);
    }

    #[test]
    fn prose_with_no_signals_is_atomic() {
        assert_eq!(
            classify("fix the typo in README line 10"),
            ComplexityTier::Atomic
        );
    }

    #[test]
    fn a_single_file_target_is_moderate() {
        assert_eq!(
            classify("refactor the login flow in src/login.rs"),
            ComplexityTier::Moderate
        );
    }

    #[test]
    fn several_file_targets_are_complex() {
        assert_eq!(
            classify("add rate limiting to src/api.rs, src/middleware.rs and src/state.rs"),
            ComplexityTier::Complex
        );
    }

    #[test]
    fn long_prose_without_structure_is_simple() {
        let description = "make the retry loop wait a little longer between calls so that \
                           the upstream service has time to recover before we try again";
        assert_eq!(classify(description), ComplexityTier::Simple);
    }
}
