use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pathway_core::model::{
    Dependency, DependencyType, EdgeId, ElementId, ElementProgress, Graph, GraphId, GraphNode,
    Lesson, LessonId, LessonProgress, MinScore, NodeId, StudentId, SubjectId,
};
use pathway_core::unlock::UnlockChange;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── RECORDS ───────────────────────────────────────────────────────────────────
//

/// Insert shape for a graph; the id is assigned by storage.
#[derive(Debug, Clone)]
pub struct NewGraphRecord {
    pub student_id: StudentId,
    pub subject_id: SubjectId,
    pub allow_skip: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for a node. Nodes are always created locked.
#[derive(Debug, Clone)]
pub struct NewNodeRecord {
    pub graph_id: GraphId,
    pub lesson_id: LessonId,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for an already validated edge.
#[derive(Debug, Clone)]
pub struct NewEdgeRecord {
    pub graph_id: GraphId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub dependency_type: DependencyType,
    pub min_score: MinScore,
    pub created_at: DateTime<Utc>,
}

/// Everything one progress-driven entry point writes, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct ProgressChanges {
    pub element_progress: Vec<ElementProgress>,
    pub lesson_progress: Vec<LessonProgress>,
    pub unlocks: Vec<UnlockChange>,
}

impl ProgressChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.element_progress.is_empty() && self.lesson_progress.is_empty() && self.unlocks.is_empty()
    }
}

/// Edge deletion plus the unlocks it enables.
#[derive(Debug, Clone)]
pub struct EdgeRemoval {
    pub edge_id: EdgeId,
    pub unlocks: Vec<UnlockChange>,
}

/// Node deletion with its progress purge and the recalculated lock states.
///
/// The node row is removed if it still exists; edges touching it and every
/// progress row referencing it are deleted before `unlocks` are applied.
#[derive(Debug, Clone)]
pub struct NodeRemoval {
    pub graph_id: GraphId,
    pub node_id: NodeId,
    pub unlocks: Vec<UnlockChange>,
}

/// Row counts reported by `apply_node_removal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalCounts {
    pub node_removed: bool,
    pub edges_removed: u64,
    pub lesson_progress_removed: u64,
    pub element_progress_removed: u64,
}

//
// ─── CONTRACTS ─────────────────────────────────────────────────────────────────
//

/// Graphs, nodes and edges.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    /// Create a graph.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the student already has a graph for the subject.
    async fn insert_graph(&self, graph: NewGraphRecord) -> Result<Graph, StorageError>;

    async fn get_graph(&self, id: GraphId) -> Result<Option<Graph>, StorageError>;

    async fn find_graph(
        &self,
        student_id: StudentId,
        subject_id: SubjectId,
    ) -> Result<Option<Graph>, StorageError>;

    /// Place a lesson in a graph.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the graph is missing and
    /// `StorageError::Conflict` if the lesson is already in the graph.
    async fn insert_node(&self, node: NewNodeRecord) -> Result<GraphNode, StorageError>;

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StorageError>;

    /// Nodes of a graph in ascending id order.
    async fn list_nodes(&self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError>;

    /// Persist an edge that already passed structural validation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the `(from, to)` pair exists.
    async fn insert_edge(&self, edge: NewEdgeRecord) -> Result<Dependency, StorageError>;

    async fn get_edge(&self, id: EdgeId) -> Result<Option<Dependency>, StorageError>;

    /// Edges of a graph in ascending id order.
    async fn list_edges(&self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError>;
}

/// Read/write access to lesson definitions.
#[async_trait]
pub trait LessonCatalog: Send + Sync {
    /// Insert or replace a lesson together with its elements.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if an element id already belongs to another lesson.
    async fn upsert_lesson(&self, lesson: &Lesson) -> Result<(), StorageError>;

    async fn get_lesson(&self, id: LessonId) -> Result<Option<Lesson>, StorageError>;

    async fn list_lessons(&self, limit: u32) -> Result<Vec<Lesson>, StorageError>;
}

/// Progress reads.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn list_element_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError>;

    async fn get_lesson_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Option<LessonProgress>, StorageError>;

    /// Lesson progress of one student across the nodes currently in a graph.
    async fn list_lesson_progress(
        &self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError>;

    /// Students with any progress row on a node currently in the graph.
    async fn students_in_graph(&self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError>;

    /// Students with any progress row referencing `node_id`, whether or not the node still exists.
    async fn students_on_node(&self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError>;
}

/// One exclusive read-plan-commit cycle against the store.
///
/// While a transaction is open no other transaction on the same store can
/// begin, including one from another process sharing the same `SQLite` file,
/// so everything read here is still current when the commit lands. Each
/// commit method ends the transaction and writes all of its changes or none
/// of them. Dropping the transaction without committing discards it.
#[async_trait]
pub trait GraphTransaction: Send {
    async fn get_graph(&mut self, id: GraphId) -> Result<Option<Graph>, StorageError>;

    async fn get_node(&mut self, id: NodeId) -> Result<Option<GraphNode>, StorageError>;

    async fn list_nodes(&mut self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError>;

    async fn list_edges(&mut self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError>;

    async fn list_element_progress(
        &mut self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError>;

    async fn list_lesson_progress(
        &mut self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError>;

    async fn students_in_graph(&mut self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError>;

    async fn students_on_node(&mut self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError>;

    /// Persist an edge that passed validation against this transaction's reads.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the `(from, to)` pair exists and
    /// `StorageError::NotFound` if an endpoint is not in the edge's graph.
    async fn insert_edge(self: Box<Self>, edge: NewEdgeRecord) -> Result<Dependency, StorageError>;

    /// Upsert progress rows and apply lock changes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if an unlock targets a missing node.
    async fn apply_progress(self: Box<Self>, changes: &ProgressChanges) -> Result<(), StorageError>;

    /// Delete an edge and apply the unlocks its removal enables.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the edge or an unlocked node is missing.
    async fn apply_edge_removal(self: Box<Self>, removal: &EdgeRemoval) -> Result<(), StorageError>;

    /// Delete a node with its edges and progress, then apply recalculated lock states.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if a lock change targets a missing node.
    async fn apply_node_removal(
        self: Box<Self>,
        removal: &NodeRemoval,
    ) -> Result<RemovalCounts, StorageError>;
}

/// Entry point for atomic writes.
#[async_trait]
pub trait ProgressPersistence: Send + Sync {
    /// Open a transaction, waiting until any other open one has finished.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the store cannot start one.
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError>;
}

//
// ─── IN-MEMORY ─────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct MemoryState {
    next_graph_id: u64,
    next_node_id: u64,
    next_edge_id: u64,
    graphs: BTreeMap<GraphId, Graph>,
    nodes: BTreeMap<NodeId, GraphNode>,
    edges: BTreeMap<EdgeId, Dependency>,
    lessons: BTreeMap<LessonId, Lesson>,
    element_progress: BTreeMap<(StudentId, NodeId, ElementId), ElementProgress>,
    lesson_progress: BTreeMap<(StudentId, NodeId), LessonProgress>,
}

impl MemoryState {
    fn check_unlocks(&self, unlocks: &[UnlockChange]) -> Result<(), StorageError> {
        if unlocks.iter().all(|u| self.nodes.contains_key(&u.node_id)) {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    fn apply_unlocks(&mut self, unlocks: &[UnlockChange]) {
        for change in unlocks {
            if let Some(node) = self.nodes.get_mut(&change.node_id) {
                node.is_unlocked = change.unlocked_at.is_some();
                node.unlocked_at = change.unlocked_at;
            }
        }
    }

    fn graph_node_ids(&self, graph_id: GraphId) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.graph_id == graph_id)
            .map(|n| n.id)
            .collect()
    }
}

/// In-memory repository for tests and prototyping.
///
/// A single mutex guards all tables, so every write method is atomic.
/// Transactions additionally hold `writer`, which clones of the repository
/// share.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
    writer: Arc<AsyncMutex<()>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl GraphRepository for InMemoryRepository {
    async fn insert_graph(&self, graph: NewGraphRecord) -> Result<Graph, StorageError> {
        let mut guard = self.lock()?;
        if guard
            .graphs
            .values()
            .any(|g| g.student_id == graph.student_id && g.subject_id == graph.subject_id)
        {
            return Err(StorageError::Conflict);
        }
        guard.next_graph_id += 1;
        let stored = Graph {
            id: GraphId::new(guard.next_graph_id),
            student_id: graph.student_id,
            subject_id: graph.subject_id,
            allow_skip: graph.allow_skip,
            created_at: graph.created_at,
        };
        guard.graphs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_graph(&self, id: GraphId) -> Result<Option<Graph>, StorageError> {
        Ok(self.lock()?.graphs.get(&id).cloned())
    }

    async fn find_graph(
        &self,
        student_id: StudentId,
        subject_id: SubjectId,
    ) -> Result<Option<Graph>, StorageError> {
        Ok(self
            .lock()?
            .graphs
            .values()
            .find(|g| g.student_id == student_id && g.subject_id == subject_id)
            .cloned())
    }

    async fn insert_node(&self, node: NewNodeRecord) -> Result<GraphNode, StorageError> {
        let mut guard = self.lock()?;
        if !guard.graphs.contains_key(&node.graph_id) {
            return Err(StorageError::NotFound);
        }
        if guard
            .nodes
            .values()
            .any(|n| n.graph_id == node.graph_id && n.lesson_id == node.lesson_id)
        {
            return Err(StorageError::Conflict);
        }
        guard.next_node_id += 1;
        let stored = GraphNode {
            id: NodeId::new(guard.next_node_id),
            graph_id: node.graph_id,
            lesson_id: node.lesson_id,
            is_unlocked: false,
            unlocked_at: None,
            created_at: node.created_at,
        };
        guard.nodes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StorageError> {
        Ok(self.lock()?.nodes.get(&id).cloned())
    }

    async fn list_nodes(&self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError> {
        Ok(self
            .lock()?
            .nodes
            .values()
            .filter(|n| n.graph_id == graph_id)
            .cloned()
            .collect())
    }

    async fn insert_edge(&self, edge: NewEdgeRecord) -> Result<Dependency, StorageError> {
        let mut guard = self.lock()?;
        let endpoints_ok = [edge.from_node, edge.to_node].iter().all(|id| {
            guard
                .nodes
                .get(id)
                .is_some_and(|n| n.graph_id == edge.graph_id)
        });
        if !endpoints_ok {
            return Err(StorageError::NotFound);
        }
        if guard
            .edges
            .values()
            .any(|e| e.from_node == edge.from_node && e.to_node == edge.to_node)
        {
            return Err(StorageError::Conflict);
        }
        guard.next_edge_id += 1;
        let stored = Dependency {
            id: EdgeId::new(guard.next_edge_id),
            graph_id: edge.graph_id,
            from_node: edge.from_node,
            to_node: edge.to_node,
            dependency_type: edge.dependency_type,
            min_score: edge.min_score,
            created_at: edge.created_at,
        };
        guard.edges.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_edge(&self, id: EdgeId) -> Result<Option<Dependency>, StorageError> {
        Ok(self.lock()?.edges.get(&id).cloned())
    }

    async fn list_edges(&self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError> {
        Ok(self
            .lock()?
            .edges
            .values()
            .filter(|e| e.graph_id == graph_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LessonCatalog for InMemoryRepository {
    async fn upsert_lesson(&self, lesson: &Lesson) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let taken = guard
            .lessons
            .values()
            .filter(|other| other.id() != lesson.id())
            .flat_map(Lesson::elements)
            .any(|e| lesson.element(e.id).is_some());
        if taken {
            return Err(StorageError::Conflict);
        }
        guard.lessons.insert(lesson.id(), lesson.clone());
        Ok(())
    }

    async fn get_lesson(&self, id: LessonId) -> Result<Option<Lesson>, StorageError> {
        Ok(self.lock()?.lessons.get(&id).cloned())
    }

    async fn list_lessons(&self, limit: u32) -> Result<Vec<Lesson>, StorageError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self.lock()?.lessons.values().take(limit).cloned().collect())
    }
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn list_element_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError> {
        Ok(self
            .lock()?
            .element_progress
            .values()
            .filter(|p| p.student_id == student_id && p.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn get_lesson_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        Ok(self
            .lock()?
            .lesson_progress
            .get(&(student_id, node_id))
            .cloned())
    }

    async fn list_lesson_progress(
        &self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        let guard = self.lock()?;
        let nodes = guard.graph_node_ids(graph_id);
        Ok(guard
            .lesson_progress
            .values()
            .filter(|p| p.student_id == student_id && nodes.contains(&p.node_id))
            .cloned()
            .collect())
    }

    async fn students_in_graph(&self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError> {
        let guard = self.lock()?;
        let nodes = guard.graph_node_ids(graph_id);
        let students: BTreeSet<StudentId> = guard
            .lesson_progress
            .values()
            .map(|p| (p.student_id, p.node_id))
            .chain(guard.element_progress.values().map(|p| (p.student_id, p.node_id)))
            .filter(|(_, node)| nodes.contains(node))
            .map(|(student, _)| student)
            .collect();
        Ok(students.into_iter().collect())
    }

    async fn students_on_node(&self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError> {
        let guard = self.lock()?;
        let students: BTreeSet<StudentId> = guard
            .lesson_progress
            .values()
            .map(|p| (p.student_id, p.node_id))
            .chain(guard.element_progress.values().map(|p| (p.student_id, p.node_id)))
            .filter(|(_, node)| *node == node_id)
            .map(|(student, _)| student)
            .collect();
        Ok(students.into_iter().collect())
    }
}

impl InMemoryRepository {
    fn commit_progress(&self, changes: &ProgressChanges) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        guard.check_unlocks(&changes.unlocks)?;

        for p in &changes.element_progress {
            guard
                .element_progress
                .insert((p.student_id, p.node_id, p.element_id), p.clone());
        }
        for p in &changes.lesson_progress {
            guard
                .lesson_progress
                .insert((p.student_id, p.node_id), p.clone());
        }
        guard.apply_unlocks(&changes.unlocks);
        Ok(())
    }

    fn commit_edge_removal(&self, removal: &EdgeRemoval) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.edges.contains_key(&removal.edge_id) {
            return Err(StorageError::NotFound);
        }
        guard.check_unlocks(&removal.unlocks)?;

        guard.edges.remove(&removal.edge_id);
        guard.apply_unlocks(&removal.unlocks);
        Ok(())
    }

    fn commit_node_removal(&self, removal: &NodeRemoval) -> Result<RemovalCounts, StorageError> {
        let mut guard = self.lock()?;
        let node_id = removal.node_id;
        if removal.unlocks.iter().any(|u| u.node_id == node_id) {
            return Err(StorageError::Conflict);
        }
        guard.check_unlocks(&removal.unlocks)?;

        let element_before = guard.element_progress.len();
        guard.element_progress.retain(|(_, node, _), _| *node != node_id);
        let lesson_before = guard.lesson_progress.len();
        guard.lesson_progress.retain(|(_, node), _| *node != node_id);
        let edges_before = guard.edges.len();
        guard.edges.retain(|_, e| !e.touches(node_id));
        let node_removed = guard
            .nodes
            .get(&node_id)
            .is_some_and(|n| n.graph_id == removal.graph_id)
            && guard.nodes.remove(&node_id).is_some();

        guard.apply_unlocks(&removal.unlocks);

        Ok(RemovalCounts {
            node_removed,
            edges_removed: (edges_before - guard.edges.len()) as u64,
            lesson_progress_removed: (lesson_before - guard.lesson_progress.len()) as u64,
            element_progress_removed: (element_before - guard.element_progress.len()) as u64,
        })
    }
}

#[async_trait]
impl ProgressPersistence for InMemoryRepository {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            repo: self.clone(),
            _writer: writer,
        }))
    }
}

/// Transaction over `InMemoryRepository`; reads go straight to the shared state.
struct MemoryTransaction {
    repo: InMemoryRepository,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn get_graph(&mut self, id: GraphId) -> Result<Option<Graph>, StorageError> {
        self.repo.get_graph(id).await
    }

    async fn get_node(&mut self, id: NodeId) -> Result<Option<GraphNode>, StorageError> {
        self.repo.get_node(id).await
    }

    async fn list_nodes(&mut self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError> {
        self.repo.list_nodes(graph_id).await
    }

    async fn list_edges(&mut self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError> {
        self.repo.list_edges(graph_id).await
    }

    async fn list_element_progress(
        &mut self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError> {
        self.repo.list_element_progress(student_id, node_id).await
    }

    async fn list_lesson_progress(
        &mut self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        self.repo.list_lesson_progress(student_id, graph_id).await
    }

    async fn students_in_graph(&mut self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError> {
        self.repo.students_in_graph(graph_id).await
    }

    async fn students_on_node(&mut self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError> {
        self.repo.students_on_node(node_id).await
    }

    async fn insert_edge(self: Box<Self>, edge: NewEdgeRecord) -> Result<Dependency, StorageError> {
        self.repo.insert_edge(edge).await
    }

    async fn apply_progress(self: Box<Self>, changes: &ProgressChanges) -> Result<(), StorageError> {
        self.repo.commit_progress(changes)
    }

    async fn apply_edge_removal(self: Box<Self>, removal: &EdgeRemoval) -> Result<(), StorageError> {
        self.repo.commit_edge_removal(removal)
    }

    async fn apply_node_removal(
        self: Box<Self>,
        removal: &NodeRemoval,
    ) -> Result<RemovalCounts, StorageError> {
        self.repo.commit_node_removal(removal)
    }
}

/// Aggregates repositories behind trait objects so backends can be swapped.
#[derive(Clone)]
pub struct Storage {
    pub graphs: Arc<dyn GraphRepository>,
    pub lessons: Arc<dyn LessonCatalog>,
    pub progress: Arc<dyn ProgressRepository>,
    pub persistence: Arc<dyn ProgressPersistence>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_repository(InMemoryRepository::new())
    }

    /// Wire every contract to one repository value.
    #[must_use]
    pub fn from_repository<R>(repo: R) -> Self
    where
        R: GraphRepository
            + LessonCatalog
            + ProgressRepository
            + ProgressPersistence
            + Clone
            + 'static,
    {
        let graphs: Arc<dyn GraphRepository> = Arc::new(repo.clone());
        let lessons: Arc<dyn LessonCatalog> = Arc::new(repo.clone());
        let progress: Arc<dyn ProgressRepository> = Arc::new(repo.clone());
        let persistence: Arc<dyn ProgressPersistence> = Arc::new(repo);
        Self {
            graphs,
            lessons,
            progress,
            persistence,
        }
    }
}
