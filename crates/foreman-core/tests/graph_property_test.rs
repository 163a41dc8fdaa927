//! Randomized checks over generated DAGs: scheduling via the ready set
//! never violates dependency order, always settles every subtask, and
//! failure cascades skip exactly the transitive dependents.

use foreman_core::graph::SubtaskGraph;
use foreman_core::types::{Capability, Subtask, SubtaskStatus};
use proptest::collection::vec;
use proptest::prelude::*;
use uuid::Uuid;

/// Build a graph of `n` subtasks where node `j` depends on node `i < j`
/// whenever `edge_bits[j][i]` is set. Construction order makes cycles
/// impossible.
fn build_graph(n: usize, edge_bits: &[Vec<bool>]) -> (SubtaskGraph, Vec<Uuid>) {
    let task_id = Uuid::new_v4();
    let mut graph = SubtaskGraph::new();
    let mut ids = Vec::with_capacity(n);
    for j in 0..n {
        let deps: Vec<Uuid> = (0..j).filter(|i| edge_bits[j][*i]).map(|i| ids[i]).collect();
        let subtask =
            Subtask::new(task_id, format!("node {j}"), Capability::Implement).with_dependencies(deps);
        ids.push(subtask.id);
        graph.add(subtask).expect("construction order is topological");
    }
    (graph, ids)
}

fn dag_strategy() -> impl Strategy<Value = (usize, Vec<Vec<bool>>)> {
    (1..10usize).prop_flat_map(|n| {
        vec(vec(any::<bool>(), n), n).prop_map(move |bits| (n, bits))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_subtask_settles_and_order_is_respected((n, bits) in dag_strategy()) {
        let (mut graph, ids) = build_graph(n, &bits);
        prop_assert!(graph.topo_order().is_ok());

        let mut waves = 0;
        loop {
            let ready = graph.ready_ids();
            if ready.is_empty() {
                break;
            }
            waves += 1;
            prop_assert!(waves <= n, "scheduler failed to make progress");
            for id in ready {
                // set_status(Running) re-checks dependency success, so a
                // premature dispatch would error out here.
                graph.set_status(id, SubtaskStatus::Ready).unwrap();
                graph.set_status(id, SubtaskStatus::Running).unwrap();
                graph.set_status(id, SubtaskStatus::Succeeded).unwrap();
            }
        }

        prop_assert!(graph.is_settled());
        prop_assert!(graph.all_succeeded());
        for id in ids {
            prop_assert_eq!(graph.get(id).unwrap().status, SubtaskStatus::Succeeded);
        }
    }

    #[test]
    fn failure_skips_exactly_the_descendants(
        (n, bits) in dag_strategy(),
        fail_pick in any::<prop::sample::Index>(),
    ) {
        let (mut graph, ids) = build_graph(n, &bits);
        let fail_id = ids[fail_pick.index(n)];
        let doomed = graph.descendants_of(fail_id);

        loop {
            let ready = graph.ready_ids();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                graph.set_status(id, SubtaskStatus::Ready).unwrap();
                graph.set_status(id, SubtaskStatus::Running).unwrap();
                if id == fail_id {
                    graph.set_status(id, SubtaskStatus::Failed).unwrap();
                    graph.skip_descendants(id);
                } else {
                    graph.set_status(id, SubtaskStatus::Succeeded).unwrap();
                }
            }
        }

        prop_assert!(graph.is_settled());
        for id in &ids {
            let status = graph.get(*id).unwrap().status;
            if *id == fail_id {
                prop_assert_eq!(status, SubtaskStatus::Failed);
            } else if doomed.contains(id) {
                prop_assert_eq!(status, SubtaskStatus::Skipped);
            } else {
                prop_assert_eq!(status, SubtaskStatus::Succeeded);
            }
        }
    }
}
