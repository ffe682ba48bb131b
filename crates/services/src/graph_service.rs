use std::sync::Arc;

use tracing::{info, warn};

use pathway_core::Clock;
use pathway_core::cycle::validate_new_edge;
use pathway_core::model::{
    Dependency, DependencyType, EdgeId, Graph, GraphError, GraphId, GraphNode, GraphSnapshot,
    LessonId, MinScore, NodeId, StudentId, SubjectId,
};
use pathway_core::unlock::plan_unlock;
use storage::repository::{
    EdgeRemoval, GraphRepository, LessonCatalog, NewEdgeRecord, NewGraphRecord, NewNodeRecord,
    ProgressPersistence, StorageError,
};

use crate::context::{
    changed_nodes, load_progress_in, load_snapshot, load_snapshot_in, snapshot_without,
};
use crate::error::GraphServiceError;
use crate::locks::GraphLocks;
use crate::unlock_engine::{RecalcReport, UnlockEngine};

/// Structural editing of graphs: nodes, dependencies and their invariants.
#[derive(Clone)]
pub struct GraphService {
    clock: Clock,
    graphs: Arc<dyn GraphRepository>,
    lessons: Arc<dyn LessonCatalog>,
    persistence: Arc<dyn ProgressPersistence>,
    locks: Arc<GraphLocks>,
    engine: Arc<UnlockEngine>,
}

impl GraphService {
    #[must_use]
    pub fn new(
        clock: Clock,
        graphs: Arc<dyn GraphRepository>,
        lessons: Arc<dyn LessonCatalog>,
        persistence: Arc<dyn ProgressPersistence>,
        locks: Arc<GraphLocks>,
        engine: Arc<UnlockEngine>,
    ) -> Self {
        Self {
            clock,
            graphs,
            lessons,
            persistence,
            locks,
            engine,
        }
    }

    /// Create the graph for a (student, subject) pair.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphAlreadyExists` if the pair already has one.
    pub async fn create_graph(
        &self,
        student_id: StudentId,
        subject_id: SubjectId,
        allow_skip: bool,
    ) -> Result<Graph, GraphServiceError> {
        let exists = GraphServiceError::GraphAlreadyExists {
            student: student_id,
            subject: subject_id,
        };
        if self.graphs.find_graph(student_id, subject_id).await?.is_some() {
            return Err(exists);
        }

        // The unique index still decides a race between two creators.
        let graph = self
            .graphs
            .insert_graph(NewGraphRecord {
                student_id,
                subject_id,
                allow_skip,
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| match e {
                StorageError::Conflict => exists,
                other => other.into(),
            })?;
        info!(graph_id = %graph.id, student_id = %student_id, subject_id = %subject_id, allow_skip, "graph created");
        Ok(graph)
    }

    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph.
    pub async fn graph(&self, graph_id: GraphId) -> Result<Graph, GraphServiceError> {
        self.graphs
            .get_graph(graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(graph_id))
    }

    /// The graph with its nodes and edges.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph.
    pub async fn snapshot(&self, graph_id: GraphId) -> Result<GraphSnapshot, GraphServiceError> {
        load_snapshot(self.graphs.as_ref(), graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(graph_id))
    }

    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph.
    pub async fn list_nodes(&self, graph_id: GraphId) -> Result<Vec<GraphNode>, GraphServiceError> {
        self.graph(graph_id).await?;
        Ok(self.graphs.list_nodes(graph_id).await?)
    }

    /// # Errors
    ///
    /// Returns `GraphServiceError::GraphNotFound` for an unknown graph.
    pub async fn list_edges(&self, graph_id: GraphId) -> Result<Vec<Dependency>, GraphServiceError> {
        self.graph(graph_id).await?;
        Ok(self.graphs.list_edges(graph_id).await?)
    }

    /// Place a catalog lesson in a graph. The new node starts locked; call
    /// `UnlockEngine::initialize_graph` once the structure is in place.
    ///
    /// # Errors
    ///
    /// Returns `GraphNotFound`, `LessonNotFound`, or `LessonAlreadyInGraph`.
    pub async fn add_node(
        &self,
        graph_id: GraphId,
        lesson_id: LessonId,
    ) -> Result<GraphNode, GraphServiceError> {
        let _guard = self.locks.acquire(graph_id).await;
        self.graph(graph_id).await?;
        if self.lessons.get_lesson(lesson_id).await?.is_none() {
            return Err(GraphServiceError::LessonNotFound(lesson_id));
        }

        let node = self
            .graphs
            .insert_node(NewNodeRecord {
                graph_id,
                lesson_id,
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| match e {
                StorageError::Conflict => GraphServiceError::LessonAlreadyInGraph {
                    graph: graph_id,
                    lesson: lesson_id,
                },
                StorageError::NotFound => GraphServiceError::GraphNotFound(graph_id),
                other => other.into(),
            })?;
        info!(graph_id = %graph_id, node_id = %node.id, lesson_id = %lesson_id, "node added");
        Ok(node)
    }

    /// Remove a node with its edges and progress, then repair lock state.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::NodeNotFound` for an unknown node.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<RecalcReport, GraphServiceError> {
        let node = self
            .graphs
            .get_node(node_id)
            .await?
            .ok_or(GraphServiceError::NodeNotFound(node_id))?;
        self.engine
            .recalc_after_node_deletion(node.graph_id, node_id)
            .await
    }

    /// Add a prerequisite edge `from -> to`.
    ///
    /// Validation order: threshold range, graph existence, self-dependency,
    /// graph membership, duplicates, cycles. Nothing is written on failure.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::Graph` for structural violations and
    /// `GraphServiceError::GraphNotFound` for an unknown graph.
    pub async fn add_dependency(
        &self,
        graph_id: GraphId,
        from: NodeId,
        to: NodeId,
        dependency_type: DependencyType,
        min_score_percent: u8,
    ) -> Result<Dependency, GraphServiceError> {
        let min_score = MinScore::new(min_score_percent)?;
        let _guard = self.locks.acquire(graph_id).await;
        let mut tx = self.persistence.begin().await?;

        let snapshot = load_snapshot_in(tx.as_mut(), graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(graph_id))?;
        if let Err(err) = validate_new_edge(&snapshot, from, to) {
            warn!(graph_id = %graph_id, from = %from, to = %to, error = %err, "dependency rejected");
            return Err(err.into());
        }

        let edge = tx
            .insert_edge(NewEdgeRecord {
                graph_id,
                from_node: from,
                to_node: to,
                dependency_type,
                min_score,
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| match e {
                StorageError::Conflict => {
                    GraphServiceError::Graph(GraphError::DuplicateEdge { from, to })
                }
                other => other.into(),
            })?;
        info!(
            graph_id = %graph_id,
            edge_id = %edge.id,
            from = %from,
            to = %to,
            dependency_type = dependency_type.as_str(),
            min_score = min_score.percent(),
            "dependency added"
        );
        Ok(edge)
    }

    /// Delete an edge and unlock its former target if the graph's student can
    /// now start it. Never re-locks. Returns the newly unlocked nodes.
    ///
    /// # Errors
    ///
    /// Returns `GraphServiceError::EdgeNotFound` for an unknown edge.
    pub async fn remove_dependency(&self, edge_id: EdgeId) -> Result<Vec<GraphNode>, GraphServiceError> {
        let edge = self
            .graphs
            .get_edge(edge_id)
            .await?
            .ok_or(GraphServiceError::EdgeNotFound(edge_id))?;
        let _guard = self.locks.acquire(edge.graph_id).await;
        let mut tx = self.persistence.begin().await?;

        let snapshot = load_snapshot_in(tx.as_mut(), edge.graph_id)
            .await?
            .ok_or(GraphServiceError::GraphNotFound(edge.graph_id))?;
        if !snapshot.edges().iter().any(|e| e.id == edge_id) {
            return Err(GraphServiceError::EdgeNotFound(edge_id));
        }
        let after = snapshot_without(&snapshot, None, |e| e.id == edge_id)?;
        let progress =
            load_progress_in(tx.as_mut(), snapshot.graph().student_id, edge.graph_id).await?;

        let unlocks: Vec<_> = plan_unlock(&after, edge.to_node, &progress, self.clock.now())
            .into_iter()
            .collect();
        tx.apply_edge_removal(&EdgeRemoval {
            edge_id,
            unlocks: unlocks.clone(),
        })
        .await
        .map_err(|e| match e {
            StorageError::NotFound => GraphServiceError::EdgeNotFound(edge_id),
            other => other.into(),
        })?;
        info!(graph_id = %edge.graph_id, edge_id = %edge_id, unlocked = unlocks.len(), "dependency removed");
        Ok(changed_nodes(&after, &unlocks))
    }
}
