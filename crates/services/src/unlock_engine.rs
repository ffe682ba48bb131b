use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pathway_core::Clock;
use pathway_core::model::{GraphId, GraphNode, LessonProgress, NodeId, StudentId};
use pathway_core::unlock::{UnlockChange, plan_initial_unlocks, plan_propagation, plan_recalculation};
use storage::repository::{
    GraphRepository, GraphTransaction, NodeRemoval, ProgressChanges, ProgressPersistence,
};

use crate::context::{changed_nodes, load_progress_in, load_snapshot_in, snapshot_without};
use crate::error::GraphServiceError;
use crate::locks::GraphLocks;

/// Outcome of `UnlockEngine::recalc_after_node_deletion`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalcReport {
    /// `false` when the node had already been removed before recalculation ran.
    pub node_removed: bool,
    pub edges_removed: u64,
    pub deleted_lesson_progress: u64,
    pub deleted_element_progress: u64,
    pub recalculated_students: usize,
    pub unlocked_nodes: Vec<NodeId>,
    pub relocked_nodes: Vec<NodeId>,
}

/// Applies the unlock planners from `pathway_core::unlock` to stored graphs.
///
/// Each public method takes the graph's lock, opens one write transaction,
/// reads a snapshot inside it, plans, and commits the plan with that same
/// transaction. Writers in other processes wait for the commit.
#[derive(Clone)]
pub struct UnlockEngine {
    clock: Clock,
    graphs: Arc<dyn GraphRepository>,
    persistence: Arc<dyn ProgressPersistence>,
    locks: Arc<GraphLocks>,
}

impl UnlockEngine {
    #[must_use]
    pub fn new(
        clock: Clock,
        graphs: Arc<dyn GraphRepository>,
        persistence: Arc<dyn ProgressPersistence>,
        locks: Arc<GraphLocks>,
    ) -> Self {
        Self {
            clock,
            graphs,
            persistence,
            locks,
        }
    }

    /// Unlock the dependents of a completed lesson that are now startable.
    ///
    /// Returns the newly unlocked nodes. Re-running it for the same lesson is a
    /// no-op, and nothing happens while the lesson is not completed.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::NodeNotFound`/`GraphNotFound` for unknown ids
    /// and `GraphServiceError::Storage` if persistence fails.
    pub async fn on_lesson_completed(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<GraphNode>, GraphServiceError> {
        let node = self
            .graphs
            .get_node(node_id)
            .await?
            .ok_or(GraphServiceError::NodeNotFound(node_id))?;
        let _guard = self.locks.acquire(node.graph_id).await;
        let mut tx = self.persistence.begin().await?;

        let snapshot = load_snapshot_in(tx.as_mut(), node.graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(node.graph_id))?;
        if !snapshot.contains(node_id) {
            return Err(GraphServiceError::NodeNotFound(node_id));
        }
        let progress = load_progress_in(tx.as_mut(), student_id, node.graph_id).await?;

        let changes = ProgressChanges {
            unlocks: plan_propagation(&snapshot, node_id, &progress, self.clock.now()),
            ..ProgressChanges::default()
        };
        if changes.is_empty() {
            debug!(student_id = %student_id, node_id = %node_id, "propagation found nothing to unlock");
            return Ok(Vec::new());
        }

        tx.apply_progress(&changes).await?;
        info!(
            student_id = %student_id,
            node_id = %node_id,
            unlocked = changes.unlocks.len(),
            "dependents unlocked"
        );
        Ok(changed_nodes(&snapshot, &changes.unlocks))
    }

    /// Unlock every locked node without required incoming edges.
    ///
    /// Safe to call again after nodes are added; already unlocked nodes are left alone.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph and
    /// `GraphServiceError::Storage` if persistence fails.
    pub async fn initialize_graph(
        &self,
        graph_id: GraphId,
    ) -> Result<Vec<GraphNode>, GraphServiceError> {
        let _guard = self.locks.acquire(graph_id).await;
        let mut tx = self.persistence.begin().await?;
        let snapshot = load_snapshot_in(tx.as_mut(), graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(graph_id))?;

        let changes = ProgressChanges {
            unlocks: plan_initial_unlocks(&snapshot, self.clock.now()),
            ..ProgressChanges::default()
        };
        if !changes.is_empty() {
            tx.apply_progress(&changes).await?;
        }
        info!(graph_id = %graph_id, unlocked = changes.unlocks.len(), "graph initialized");
        Ok(changed_nodes(&snapshot, &changes.unlocks))
    }

    /// Remove `deleted` from the graph and re-derive every node's lock state.
    ///
    /// Purges all progress rows referencing the node, then evaluates each
    /// student with progress in the graph and finally the graph's own student,
    /// who decides the stored flags. Dependents that required the deleted node
    /// are re-locked. Everything is committed atomically. If the node row is
    /// already gone, its leftover progress is still purged.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph,
    /// `GraphServiceError::NodeNotFound` if the node belongs to another graph,
    /// and `GraphServiceError::Storage` if persistence fails.
    pub async fn recalc_after_node_deletion(
        &self,
        graph_id: GraphId,
        deleted: NodeId,
    ) -> Result<RecalcReport, GraphServiceError> {
        let _guard = self.locks.acquire(graph_id).await;
        let mut tx = self.persistence.begin().await?;

        let snapshot = load_snapshot_in(tx.as_mut(), graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(graph_id))?;
        if !snapshot.contains(deleted) && tx.get_node(deleted).await?.is_some() {
            return Err(GraphServiceError::NodeNotFound(deleted));
        }

        let orphaned: BTreeSet<NodeId> = snapshot
            .required_outgoing(deleted)
            .map(|e| e.to_node)
            .collect();
        let remaining = snapshot_without(&snapshot, Some(deleted), |_| false)?;

        let students =
            affected_students(tx.as_mut(), graph_id, deleted, snapshot.graph().student_id).await?;
        let mut per_student: Vec<BTreeMap<NodeId, LessonProgress>> = Vec::with_capacity(students.len());
        for &student in &students {
            let mut progress = load_progress_in(tx.as_mut(), student, graph_id).await?;
            progress.remove(&deleted);
            per_student.push(progress);
        }

        let changes = plan_recalculation(&remaining, &per_student, &orphaned, self.clock.now());
        let counts = tx
            .apply_node_removal(&NodeRemoval {
                graph_id,
                node_id: deleted,
                unlocks: changes.clone(),
            })
            .await?;

        let (unlocked, relocked): (Vec<&UnlockChange>, Vec<&UnlockChange>) = changes.iter().partition(|c| c.is_unlock());
        let report = RecalcReport {
            node_removed: counts.node_removed,
            edges_removed: counts.edges_removed,
            deleted_lesson_progress: counts.lesson_progress_removed,
            deleted_element_progress: counts.element_progress_removed,
            recalculated_students: students.len(),
            unlocked_nodes: unlocked.iter().map(|c| c.node_id).collect(),
            relocked_nodes: relocked.iter().map(|c| c.node_id).collect(),
        };
        info!(
            graph_id = %graph_id,
            node_id = %deleted,
            students = report.recalculated_students,
            unlocked = report.unlocked_nodes.len(),
            relocked = report.relocked_nodes.len(),
            "graph recalculated after node deletion"
        );
        Ok(report)
    }
}

/// Students with progress in the graph or on the deleted node, owner last.
async fn affected_students(
    tx: &mut dyn GraphTransaction,
    graph_id: GraphId,
    deleted: NodeId,
    owner: StudentId,
) -> Result<Vec<StudentId>, GraphServiceError> {
    let mut others: BTreeSet<StudentId> = tx.students_in_graph(graph_id).await?.into_iter().collect();
    others.extend(tx.students_on_node(deleted).await?);
    others.remove(&owner);

    let mut students: Vec<StudentId> = others.into_iter().collect();
    students.push(owner);
    Ok(students)
}
