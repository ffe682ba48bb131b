//! Loaders shared by the services: graph snapshots and per-student progress maps.

use std::collections::BTreeMap;

use pathway_core::model::{
    Dependency, Graph, GraphId, GraphNode, GraphSnapshot, LessonProgress, NodeId, StudentId,
};
use pathway_core::unlock::UnlockChange;
use storage::repository::{GraphRepository, GraphTransaction, ProgressRepository, StorageError};

/// Load a graph with all of its nodes and edges; `None` when the graph is missing.
pub(crate) async fn load_snapshot(
    graphs: &dyn GraphRepository,
    graph_id: GraphId,
) -> Result<Option<GraphSnapshot>, StorageError> {
    let Some(graph) = graphs.get_graph(graph_id).await? else {
        return Ok(None);
    };
    let nodes = graphs.list_nodes(graph_id).await?;
    let edges = graphs.list_edges(graph_id).await?;
    assemble(graph, nodes, edges).map(Some)
}

/// [`load_snapshot`] read inside a write transaction.
pub(crate) async fn load_snapshot_in(
    tx: &mut dyn GraphTransaction,
    graph_id: GraphId,
) -> Result<Option<GraphSnapshot>, StorageError> {
    let Some(graph) = tx.get_graph(graph_id).await? else {
        return Ok(None);
    };
    let nodes = tx.list_nodes(graph_id).await?;
    let edges = tx.list_edges(graph_id).await?;
    assemble(graph, nodes, edges).map(Some)
}

fn assemble(
    graph: Graph,
    nodes: Vec<GraphNode>,
    edges: Vec<Dependency>,
) -> Result<GraphSnapshot, StorageError> {
    GraphSnapshot::new(graph, nodes, edges).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// The same graph with some nodes and edges left out.
pub(crate) fn snapshot_without(
    snapshot: &GraphSnapshot,
    skip_node: Option<NodeId>,
    skip_edge: impl Fn(&Dependency) -> bool,
) -> Result<GraphSnapshot, StorageError> {
    let nodes = snapshot
        .nodes()
        .filter(|n| Some(n.id) != skip_node)
        .cloned()
        .collect();
    let edges = snapshot
        .edges()
        .iter()
        .filter(|e| !skip_edge(e))
        .filter(|e| skip_node.is_none_or(|n| !e.touches(n)))
        .cloned()
        .collect();
    GraphSnapshot::new(snapshot.graph().clone(), nodes, edges)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// A student's lesson progress across the graph, keyed by node.
pub(crate) async fn load_progress(
    progress: &dyn ProgressRepository,
    student_id: StudentId,
    graph_id: GraphId,
) -> Result<BTreeMap<NodeId, LessonProgress>, StorageError> {
    Ok(progress
        .list_lesson_progress(student_id, graph_id)
        .await?
        .into_iter()
        .map(|p| (p.node_id, p))
        .collect())
}

/// [`load_progress`] read inside a write transaction.
pub(crate) async fn load_progress_in(
    tx: &mut dyn GraphTransaction,
    student_id: StudentId,
    graph_id: GraphId,
) -> Result<BTreeMap<NodeId, LessonProgress>, StorageError> {
    Ok(tx
        .list_lesson_progress(student_id, graph_id)
        .await?
        .into_iter()
        .map(|p| (p.node_id, p))
        .collect())
}

/// Nodes touched by `changes` as they look once the changes are applied.
pub(crate) fn changed_nodes(snapshot: &GraphSnapshot, changes: &[UnlockChange]) -> Vec<GraphNode> {
    let mut after = snapshot.clone();
    after.apply_unlocks(changes);
    changes
        .iter()
        .filter_map(|c| after.node(c.node_id).cloned())
        .collect()
}
