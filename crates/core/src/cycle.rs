//! Cycle detection for prerequisite edges.
//!
//! The check runs before an edge is persisted, so the stored edge set of a
//! graph is acyclic at every point in time. Graphs hold at most a few dozen
//! lessons, so the whole candidate graph is walked on every insertion and no
//! traversal state survives between calls.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{GraphError, GraphSnapshot, NodeId};

/// Returns `true` if adding `from -> to` to `edges` creates a directed cycle.
///
/// Builds the adjacency list including the candidate, then runs a depth-first
/// walk from `to`, tracking the nodes on the current path. Reaching a node
/// that is already on the path means a cycle.
#[must_use]
pub fn creates_cycle(edges: &[(NodeId, NodeId)], from: NodeId, to: NodeId) -> bool {
    let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for &(a, b) in edges.iter().chain(std::iter::once(&(from, to))) {
        adjacency.entry(a).or_default().push(b);
    }

    let mut visited = BTreeSet::new();
    let mut on_path = BTreeSet::new();
    has_cycle_from(to, &adjacency, &mut visited, &mut on_path)
}

fn has_cycle_from(
    node: NodeId,
    adjacency: &BTreeMap<NodeId, Vec<NodeId>>,
    visited: &mut BTreeSet<NodeId>,
    on_path: &mut BTreeSet<NodeId>,
) -> bool {
    visited.insert(node);
    on_path.insert(node);

    if let Some(next) = adjacency.get(&node) {
        for &child in next {
            if on_path.contains(&child) {
                return true;
            }
            if !visited.contains(&child) && has_cycle_from(child, adjacency, visited, on_path) {
                return true;
            }
        }
    }

    on_path.remove(&node);
    false
}

/// Structural validation of a candidate edge against a graph snapshot.
///
/// Checks, in order: self-dependency, graph membership of both endpoints,
/// duplicates, then cycles.
///
/// # Errors
///
/// Returns the first `GraphError` that applies.
pub fn validate_new_edge(snapshot: &GraphSnapshot, from: NodeId, to: NodeId) -> Result<(), GraphError> {
    if from == to {
        return Err(GraphError::SelfDependency(from));
    }
    for node in [from, to] {
        if !snapshot.contains(node) {
            return Err(GraphError::EdgeCrossGraph {
                graph: snapshot.graph().id,
                node,
            });
        }
    }
    if snapshot.edge_between(from, to).is_some() {
        return Err(GraphError::DuplicateEdge { from, to });
    }
    if creates_cycle(&snapshot.adjacency_pairs(), from, to) {
        return Err(GraphError::CycleDetected { from, to });
    }
    Ok(())
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u64) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn reverse_edge_is_a_cycle() {
        let edges = [(n(1), n(2))];
        assert!(creates_cycle(&edges, n(2), n(1)));
        assert!(!creates_cycle(&edges, n(1), n(3)));
    }

    #[test]
    fn long_back_edge_is_detected() {
        let edges = [(n(1), n(2)), (n(2), n(3)), (n(3), n(4))];
        assert!(creates_cycle(&edges, n(4), n(1)));
        assert!(creates_cycle(&edges, n(3), n(2)));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        // 1 -> 2 -> 4 and 1 -> 3 -> 4; closing 2 -> 3 keeps it acyclic.
        let edges = [(n(1), n(2)), (n(1), n(3)), (n(2), n(4)), (n(3), n(4))];
        assert!(!creates_cycle(&edges, n(2), n(3)));
        assert!(creates_cycle(&edges, n(4), n(1)));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        assert!(creates_cycle(&[], n(1), n(1)));
    }

    #[test]
    fn repeated_checks_do_not_leak_state() {
        let edges = [(n(1), n(2))];
        for _ in 0..3 {
            assert!(!creates_cycle(&edges, n(2), n(3)));
            assert!(creates_cycle(&edges, n(2), n(1)));
        }
    }
}
