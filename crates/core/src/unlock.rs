//! Unlock planning.
//!
//! Planners decide which nodes change lock state and return the decisions as
//! `UnlockChange`s; the services layer commits them together with the progress
//! writes that caused them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{GraphSnapshot, NodeId};
use crate::prerequisites::{ProgressLookup, check_prerequisites};

/// New lock state for one node. `unlocked_at == None` re-locks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockChange {
    pub node_id: NodeId,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl UnlockChange {
    #[must_use]
    pub fn unlock(node_id: NodeId, at: DateTime<Utc>) -> Self {
        Self {
            node_id,
            unlocked_at: Some(at),
        }
    }

    #[must_use]
    pub fn relock(node_id: NodeId) -> Self {
        Self {
            node_id,
            unlocked_at: None,
        }
    }

    #[must_use]
    pub fn is_unlock(&self) -> bool {
        self.unlocked_at.is_some()
    }
}

impl GraphSnapshot {
    /// Apply planned changes to this snapshot's node copies.
    pub fn apply_unlocks(&mut self, changes: &[UnlockChange]) {
        for change in changes {
            self.set_unlocked(change.node_id, change.unlocked_at);
        }
    }
}

/// Unlock every locked node without required incoming edges.
#[must_use]
pub fn plan_initial_unlocks(snapshot: &GraphSnapshot, now: DateTime<Utc>) -> Vec<UnlockChange> {
    snapshot
        .nodes()
        .filter(|n| !n.is_unlocked)
        .filter(|n| snapshot.required_incoming(n.id).next().is_none())
        .map(|n| UnlockChange::unlock(n.id, now))
        .collect()
}

/// Unlock `node` if it is locked and the student can start it. Never re-locks.
#[must_use]
pub fn plan_unlock(
    snapshot: &GraphSnapshot,
    node: NodeId,
    progress: &impl ProgressLookup,
    now: DateTime<Utc>,
) -> Option<UnlockChange> {
    let target = snapshot.node(node)?;
    if target.is_unlocked {
        return None;
    }
    check_prerequisites(snapshot, node, progress)
        .can_start
        .then(|| UnlockChange::unlock(node, now))
}

/// Dependents of `completed` that become unlocked now that it is completed.
///
/// Each required outgoing edge must first be satisfied by the completed
/// lesson's score; the target is then re-checked against all of its
/// prerequisites. Already unlocked targets are skipped, so repeated calls are
/// no-ops. Returns nothing if `completed` is not completed for this student.
#[must_use]
pub fn plan_propagation(
    snapshot: &GraphSnapshot,
    completed: NodeId,
    progress: &impl ProgressLookup,
    now: DateTime<Utc>,
) -> Vec<UnlockChange> {
    let Some(prior) = progress
        .lesson_progress(completed)
        .filter(|p| p.is_completed())
    else {
        return Vec::new();
    };

    let mut targets: Vec<_> = snapshot
        .required_outgoing(completed)
        .filter(|edge| prior.meets(edge.min_score))
        .map(|edge| edge.to_node)
        .collect();
    targets.sort_unstable();
    targets.dedup();

    targets
        .into_iter()
        .filter_map(|target| plan_unlock(snapshot, target, progress, now))
        .collect()
}

/// Re-derive every node's lock state after a structural deletion.
///
/// `students` are evaluated in order on a working copy of the lock flags, so
/// the last entry decides the final state; callers pass the graph's own
/// student last. Nodes in `orphaned` lost a required prerequisite with the
/// deletion; while they still have another required prerequisite they are
/// treated as unsatisfied unless the graph allows skipping. An orphan left
/// without required prerequisites is a root and follows `can_start`.
/// This is the only planner that re-locks.
#[must_use]
pub fn plan_recalculation<P: ProgressLookup>(
    snapshot: &GraphSnapshot,
    students: &[P],
    orphaned: &BTreeSet<NodeId>,
    now: DateTime<Utc>,
) -> Vec<UnlockChange> {
    let mut working = snapshot.clone();
    let node_ids: Vec<NodeId> = snapshot.nodes().map(|n| n.id).collect();

    for progress in students {
        for &node in &node_ids {
            let held = !snapshot.allow_skip()
                && orphaned.contains(&node)
                && snapshot.required_incoming(node).next().is_some();
            let satisfied = check_prerequisites(snapshot, node, progress).can_start && !held;
            let unlocked = working.node(node).is_some_and(|n| n.is_unlocked);

            if satisfied && !unlocked {
                working.set_unlocked(node, Some(now));
            } else if !satisfied && unlocked {
                working.set_unlocked(node, None);
            }
        }
    }

    node_ids
        .into_iter()
        .filter_map(|id| {
            let before = snapshot.node(id)?;
            let after = working.node(id)?;
            match (before.is_unlocked, after.is_unlocked) {
                (false, true) => Some(UnlockChange::unlock(id, now)),
                (true, false) => Some(UnlockChange::relock(id)),
                _ => None,
            }
        })
        .collect()
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
