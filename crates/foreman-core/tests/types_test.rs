use chrono::Utc;
use foreman_core::types::{
    AgentAttempt, Capability, ComplexityTier, ExecutionPattern, PipelineState, Strategy, Subtask,
    SubtaskStatus, Task, TaskStage,
};
use uuid::Uuid;

#[test]
fn stage_machine_accepts_the_full_pipeline() {
    let chain = [
        TaskStage::Submitted,
        TaskStage::Routing,
        TaskStage::Implementing,
        TaskStage::Reviewing,
        TaskStage::Testing,
        TaskStage::Complete,
    ];
    for pair in chain.windows(2) {
        assert!(
            pair[0].can_transition_to(&pair[1]),
            "{} -> {} should be legal",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn stage_machine_rejects_backwards_and_terminal_exits() {
    assert!(!TaskStage::Implementing.can_transition_to(&TaskStage::Routing));
    assert!(!TaskStage::Testing.can_transition_to(&TaskStage::Implementing));
    assert!(!TaskStage::Complete.can_transition_to(&TaskStage::Failed));
    assert!(!TaskStage::Escalated.can_transition_to(&TaskStage::Routing));
    assert!(!TaskStage::Failed.can_transition_to(&TaskStage::Submitted));
}

#[test]
fn any_live_stage_can_fail_or_escalate() {
    for stage in [
        TaskStage::Submitted,
        TaskStage::Routing,
        TaskStage::Implementing,
        TaskStage::Reviewing,
        TaskStage::Testing,
    ] {
        assert!(stage.can_transition_to(&TaskStage::Failed));
        assert!(stage.can_transition_to(&TaskStage::Escalated));
    }
}

#[test]
fn single_subtask_pattern_can_complete_from_implementing() {
    assert!(TaskStage::Implementing.can_transition_to(&TaskStage::Complete));
}

#[test]
fn subtask_status_allows_retry_requeue() {
    assert!(SubtaskStatus::Running.can_transition_to(&SubtaskStatus::Ready));
    assert!(SubtaskStatus::Ready.can_transition_to(&SubtaskStatus::Running));
    assert!(!SubtaskStatus::Failed.can_transition_to(&SubtaskStatus::Ready));
    assert!(!SubtaskStatus::Succeeded.can_transition_to(&SubtaskStatus::Running));
    assert!(!SubtaskStatus::Pending.can_transition_to(&SubtaskStatus::Running));
}

#[test]
fn tiers_order_and_map_to_patterns() {
    assert!(ComplexityTier::Atomic < ComplexityTier::Simple);
    assert!(ComplexityTier::Moderate < ComplexityTier::Complex);
    assert_eq!(ComplexityTier::Atomic.pattern(), ExecutionPattern::Single);
    assert_eq!(ComplexityTier::Simple.pattern(), ExecutionPattern::Single);
    assert_eq!(ComplexityTier::Moderate.pattern(), ExecutionPattern::Pipeline);
    assert_eq!(ComplexityTier::Complex.pattern(), ExecutionPattern::ForkJoin);
    assert_eq!(
        ComplexityTier::Enterprise.pattern(),
        ExecutionPattern::ForkJoin
    );
}

#[test]
fn tried_strategies_are_reconstructed_from_attempts() {
    let task = Task::new("demo");
    let mut state = PipelineState::new(task, 3);
    let subtask = Subtask::new(state.task.id, "work", Capability::Implement);
    let sid = subtask.id;

    state.attempts.push(AgentAttempt::failure(
        sid,
        1,
        Strategy::Direct,
        Utc::now(),
        "syntax error near line 3",
    ));
    state.attempts.push(AgentAttempt::failure(
        sid,
        2,
        Strategy::MechanicalFix,
        Utc::now(),
        "tests failed",
    ));
    state.attempts.push(AgentAttempt::success(
        sid,
        3,
        Strategy::Regenerate,
        Utc::now(),
        "done",
        vec!["src/lib.rs".into()],
    ));

    assert_eq!(
        state.tried_strategies(sid),
        vec![Strategy::Direct, Strategy::MechanicalFix]
    );
    assert_eq!(state.failed_attempt_count(sid), 2);
    assert_eq!(state.attempt_count(sid), 3);
    // Attempts for other subtasks never leak in.
    assert_eq!(state.failed_attempt_count(Uuid::new_v4()), 0);
}

#[test]
fn files_touched_unions_in_first_seen_order() {
    let task = Task::new("demo");
    let mut state = PipelineState::new(task, 3);
    let sid = Uuid::new_v4();

    let mut failed = AgentAttempt::failure(sid, 1, Strategy::Direct, Utc::now(), "tests failed");
    failed.files_touched = vec!["src/a.rs".into(), "src/b.rs".into()];
    state.attempts.push(failed);
    state.attempts.push(AgentAttempt::success(
        sid,
        2,
        Strategy::MechanicalFix,
        Utc::now(),
        "ok",
        vec!["src/b.rs".into(), "src/c.rs".into()],
    ));

    assert_eq!(
        state.files_touched(),
        vec!["src/a.rs", "src/b.rs", "src/c.rs"]
    );
    assert_eq!(state.files_touched_successful(), vec!["src/b.rs", "src/c.rs"]);
}

#[test]
fn enums_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&Strategy::MechanicalFix).unwrap(),
        "\"mechanical_fix\""
    );
    assert_eq!(
        serde_json::to_string(&TaskStage::Implementing).unwrap(),
        "\"implementing\""
    );
    assert_eq!(
        serde_json::to_string(&SubtaskStatus::Succeeded).unwrap(),
        "\"succeeded\""
    );
}

#[test]
fn pipeline_state_snapshot_round_trips() {
    let task = Task::new("round trip").with_declared_tier(ComplexityTier::Moderate);
    let mut state = PipelineState::new(task, 3);
    let subtask = Subtask::new(state.task.id, "implement", Capability::Implement);
    let sid = subtask.id;
    state.graph.add(subtask).unwrap();
    state.attempts.push(AgentAttempt::failure(
        sid,
        1,
        Strategy::Direct,
        Utc::now(),
        "parse error",
    ));

    let json = serde_json::to_string_pretty(&state).unwrap();
    let back: PipelineState = serde_json::from_str(&json).unwrap();
    assert_eq!(back.id, state.id);
    assert_eq!(back.stage, TaskStage::Submitted);
    assert_eq!(back.attempts.len(), 1);
    assert_eq!(back.graph.len(), 1);
    assert_eq!(back.task.declared_tier, Some(ComplexityTier::Moderate));
}
