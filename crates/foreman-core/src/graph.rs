use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Capability, Subtask, SubtaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("subtask {0} already present")]
    DuplicateSubtask(Uuid),
    #[error("subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency { subtask: Uuid, dependency: Uuid },
    #[error("unknown subtask {0}")]
    UnknownSubtask(Uuid),
    #[error("subtask {subtask}: invalid status change {from:?} -> {to:?}")]
    InvalidStatusChange {
        subtask: Uuid,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },
    #[error("subtask {0} cannot run before all dependencies succeeded")]
    DependenciesNotMet(Uuid),
    #[error("dependency cycle detected")]
    Cycle,
}

// ---------------------------------------------------------------------------
// SubtaskGraph
// ---------------------------------------------------------------------------

/// The dependency graph of one task's subtasks.
///
/// Subtasks are kept in insertion order; edges are the `depends_on` lists.
/// Insertion requires dependencies to already be present, so a graph built
/// through [`add`](Self::add) is acyclic by construction. Graphs restored
/// from a snapshot should be checked with [`validate`](Self::validate).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskGraph {
    subtasks: Vec<Subtask>,
}

impl SubtaskGraph {
    pub fn new() -> Self {
        Self { subtasks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Insert a subtask. Every dependency must already be present.
    pub fn add(&mut self, subtask: Subtask) -> Result<(), GraphError> {
        if self.get(subtask.id).is_some() {
            return Err(GraphError::DuplicateSubtask(subtask.id));
        }
        for dep in &subtask.depends_on {
            if self.get(*dep).is_none() {
                return Err(GraphError::UnknownDependency {
                    subtask: subtask.id,
                    dependency: *dep,
                });
            }
        }
        self.subtasks.push(subtask);
        Ok(())
    }

    /// Change a subtask's status, enforcing the legal-transition table.
    /// Entering `running` additionally requires every dependency to have
    /// succeeded.
    pub fn set_status(&mut self, id: Uuid, status: SubtaskStatus) -> Result<(), GraphError> {
        if status == SubtaskStatus::Running && !self.dependencies_succeeded(id)? {
            return Err(GraphError::DependenciesNotMet(id));
        }
        let subtask = self.get_mut(id).ok_or(GraphError::UnknownSubtask(id))?;
        if !subtask.status.can_transition_to(&status) {
            return Err(GraphError::InvalidStatusChange {
                subtask: id,
                from: subtask.status,
                to: status,
            });
        }
        subtask.status = status;
        Ok(())
    }

    /// Returns `true` when every dependency of `id` has succeeded.
    pub fn dependencies_succeeded(&self, id: Uuid) -> Result<bool, GraphError> {
        let subtask = self.get(id).ok_or(GraphError::UnknownSubtask(id))?;
        for dep in &subtask.depends_on {
            match self.get(*dep) {
                Some(d) if d.status == SubtaskStatus::Succeeded => {}
                Some(_) => return Ok(false),
                None => {
                    return Err(GraphError::UnknownDependency {
                        subtask: id,
                        dependency: *dep,
                    })
                }
            }
        }
        Ok(true)
    }

    /// Pending subtasks whose dependencies have all succeeded, in
    /// insertion order.
    pub fn ready_ids(&self) -> Vec<Uuid> {
        self.subtasks
            .iter()
            .filter(|s| {
                s.status == SubtaskStatus::Pending
                    && self.dependencies_succeeded(s.id).unwrap_or(false)
            })
            .map(|s| s.id)
            .collect()
    }

    pub fn ids_with_status(&self, status: SubtaskStatus) -> Vec<Uuid> {
        self.subtasks
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect()
    }

    /// Transitive dependents of `id`, in insertion order.
    pub fn descendants_of(&self, id: Uuid) -> Vec<Uuid> {
        let mut reached: BTreeSet<Uuid> = BTreeSet::new();
        reached.insert(id);
        // Iterate to fixpoint; restored graphs may not be stored in
        // topological order.
        loop {
            let before = reached.len();
            for subtask in &self.subtasks {
                if subtask.depends_on.iter().any(|d| reached.contains(d)) {
                    reached.insert(subtask.id);
                }
            }
            if reached.len() == before {
                break;
            }
        }
        self.subtasks
            .iter()
            .filter(|s| s.id != id && reached.contains(&s.id))
            .map(|s| s.id)
            .collect()
    }

    /// Returns `true` when any transitive dependent of `id` is not yet
    /// terminal. A failed subtask with such dependents dooms them.
    pub fn has_unfinished_dependents(&self, id: Uuid) -> bool {
        self.descendants_of(id)
            .iter()
            .filter_map(|d| self.get(*d))
            .any(|s| !s.status.is_terminal())
    }

    /// Skip every non-terminal transitive dependent of `id`. Returns the
    /// ids that were skipped.
    pub fn skip_descendants(&mut self, id: Uuid) -> Vec<Uuid> {
        let mut skipped = Vec::new();
        for desc in self.descendants_of(id) {
            let eligible = matches!(
                self.get(desc).map(|s| s.status),
                Some(SubtaskStatus::Pending) | Some(SubtaskStatus::Ready)
            );
            if eligible && self.set_status(desc, SubtaskStatus::Skipped).is_ok() {
                skipped.push(desc);
            }
        }
        skipped
    }

    /// Skip every subtask that has not started. Used by cancellation;
    /// running subtasks are left to finish. Returns the skipped ids.
    pub fn skip_unstarted(&mut self) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .subtasks
            .iter()
            .filter(|s| {
                matches!(s.status, SubtaskStatus::Pending | SubtaskStatus::Ready)
            })
            .map(|s| s.id)
            .collect();
        let mut skipped = Vec::new();
        for id in ids {
            if self.set_status(id, SubtaskStatus::Skipped).is_ok() {
                skipped.push(id);
            }
        }
        skipped
    }

    /// Returns `true` once every subtask holds a terminal status.
    pub fn is_settled(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| s.status == SubtaskStatus::Succeeded)
    }

    /// Distinct capabilities the graph requires.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.subtasks.iter().map(|s| s.capability).collect()
    }

    /// A topological order over all subtasks, or `Cycle` when the edges
    /// do not form a DAG (possible only in data restored from disk).
    pub fn topo_order(&self) -> Result<Vec<Uuid>, GraphError> {
        let mut in_degree: Vec<usize> = Vec::with_capacity(self.subtasks.len());
        for subtask in &self.subtasks {
            let mut distinct: BTreeSet<Uuid> = BTreeSet::new();
            for dep in &subtask.depends_on {
                if self.get(*dep).is_none() {
                    return Err(GraphError::UnknownDependency {
                        subtask: subtask.id,
                        dependency: *dep,
                    });
                }
                distinct.insert(*dep);
            }
            // A dependency listed twice is one edge; the decrement below
            // fires once per distinct dependency.
            in_degree.push(distinct.len());
        }

        let mut order = Vec::with_capacity(self.subtasks.len());
        let mut done: BTreeSet<Uuid> = BTreeSet::new();
        loop {
            let mut advanced = false;
            for (i, subtask) in self.subtasks.iter().enumerate() {
                if in_degree[i] == 0 && !done.contains(&subtask.id) {
                    done.insert(subtask.id);
                    order.push(subtask.id);
                    advanced = true;
                    for (j, other) in self.subtasks.iter().enumerate() {
                        if other.depends_on.contains(&subtask.id) {
                            in_degree[j] -= 1;
                        }
                    }
                }
            }
            if order.len() == self.subtasks.len() {
                return Ok(order);
            }
            if !advanced {
                return Err(GraphError::Cycle);
            }
        }
    }

    /// Structural check for graphs restored from a snapshot: unique ids,
    /// known dependencies, no cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();
        for subtask in &self.subtasks {
            if !seen.insert(subtask.id) {
                return Err(GraphError::DuplicateSubtask(subtask.id));
            }
        }
        self.topo_order().map(|_| ())
    }
}
