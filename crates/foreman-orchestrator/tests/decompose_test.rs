use foreman_core::types::{Capability, ComplexityTier, Task};
use foreman_orchestrator::decompose::{decompose, effective_tier};

#[test]
fn an_atomic_task_yields_one_implementation_subtask() {
    let task = Task::new("fix the typo in README line 10");
    let graph = decompose(&task, 8).unwrap();

    assert_eq!(graph.len(), 1);
    let subtask = graph.iter().next().unwrap();
    assert_eq!(subtask.capability, Capability::Implement);
    assert_eq!(subtask.description, task.description);
    assert!(subtask.depends_on.is_empty());
}

#[test]
fn a_moderate_task_adds_a_dependent_validation_subtask() {
    let task = Task::new("refactor the login flow in src/login.rs");
    let graph = decompose(&task, 8).unwrap();

    assert_eq!(graph.len(), 2);
    let implement = graph
        .iter()
        .find(|subtask| subtask.capability == Capability::Implement)
        .unwrap();
    let validate = graph
        .iter()
        .find(|subtask| subtask.capability == Capability::Validate)
        .unwrap();
    assert_eq!(validate.depends_on, vec![implement.id]);
    // Only the implementation half is dispatchable at the start.
    assert_eq!(graph.ready_ids(), vec![implement.id]);
}

#[test]
fn a_complex_task_fans_out_per_file_target_behind_a_plan() {
    let task = Task::new("add rate limiting to src/api.rs, src/middleware.rs and src/state.rs");
    let graph = decompose(&task, 8).unwrap();

    assert_eq!(graph.len(), 5);
    let plan = graph
        .iter()
        .find(|subtask| subtask.capability == Capability::Plan)
        .unwrap();
    let lanes: Vec<_> = graph
        .iter()
        .filter(|subtask| subtask.capability == Capability::Implement)
        .collect();
    let validate = graph
        .iter()
        .find(|subtask| subtask.capability == Capability::Validate)
        .unwrap();

    assert_eq!(lanes.len(), 3);
    for lane in &lanes {
        assert_eq!(lane.depends_on, vec![plan.id]);
    }

    let mut gated = validate.depends_on.clone();
    gated.sort();
    let mut lane_ids: Vec<_> = lanes.iter().map(|lane| lane.id).collect();
    lane_ids.sort();
    assert_eq!(gated, lane_ids);

    for target in ["src/api.rs", "src/middleware.rs", "src/state.rs"] {
        assert!(
            lanes.iter().any(|lane| lane.description.contains(target)),
            "no lane names {target}"
        );
    }
    assert_eq!(graph.ready_ids(), vec![plan.id]);
}

#[test]
fn a_declared_tier_lowers_the_routing_but_never_raises_it() {
    let lowered = Task::new("add rate limiting to src/api.rs, src/middleware.rs and src/state.rs")
        .with_declared_tier(ComplexityTier::Atomic);
    assert_eq!(effective_tier(&lowered), ComplexityTier::Atomic);
    assert_eq!(decompose(&lowered, 8).unwrap().len(), 1);

    let raised =
        Task::new("fix the typo in README line 10").with_declared_tier(ComplexityTier::Enterprise);
    assert_eq!(effective_tier(&raised), ComplexityTier::Atomic);
}

#[test]
fn fan_out_is_clamped_to_the_configured_ceiling() {
    let task = Task::new("touch a/b.rs c/d.rs e/f.rs g/h.rs i/j.rs k/l.rs");
    let graph = decompose(&task, 4).unwrap();
    let lanes = graph
        .iter()
        .filter(|subtask| subtask.capability == Capability::Implement)
        .count();
    assert_eq!(lanes, 4);
}

#[test]
fn a_complex_task_without_named_targets_gets_generic_lanes() {
    let task = Task::new(
        "- overhaul the ingestion path\n- rework the storage layout\n- tighten the read path\n- modernise the write path\n- document everything",
    );
    let graph = decompose(&task, 8).unwrap();
    let lanes: Vec<_> = graph
        .iter()
        .filter(|subtask| subtask.capability == Capability::Implement)
        .collect();
    assert_eq!(lanes.len(), 2);
    assert!(lanes
        .iter()
        .any(|lane| lane.description.contains("slice 1 of 2")));
}
