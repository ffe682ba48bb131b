use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{EdgeId, GraphId, LessonId, NodeId, StudentId, SubjectId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// Structural errors raised while editing a graph.
///
/// Every variant rejects the mutation as a whole; nothing is persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    #[error("a lesson cannot depend on itself (node {0})")]
    SelfDependency(NodeId),

    #[error("node {node} does not belong to graph {graph}")]
    EdgeCrossGraph { graph: GraphId, node: NodeId },

    #[error("dependency {from} -> {to} already exists")]
    DuplicateEdge { from: NodeId, to: NodeId },

    #[error("dependency {from} -> {to} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    #[error("minimum score percent must be within 0..=100, got {0}")]
    InvalidMinScore(u8),
}

//
// ─── GRAPH ─────────────────────────────────────────────────────────────────────
//

/// One student's dependency graph for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    pub student_id: StudentId,
    pub subject_id: SubjectId,
    /// Bypasses every prerequisite check when set.
    pub allow_skip: bool,
    pub created_at: DateTime<Utc>,
}

/// A lesson placed inside a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub graph_id: GraphId,
    pub lesson_id: LessonId,
    pub is_unlocked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GraphNode {
    pub(crate) fn set_unlocked(&mut self, unlocked_at: Option<DateTime<Utc>>) {
        self.is_unlocked = unlocked_at.is_some();
        self.unlocked_at = unlocked_at;
    }
}

//
// ─── DEPENDENCIES ──────────────────────────────────────────────────────────────
//

/// Whether an edge gates its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Gates unlocking of the target.
    Required,
    /// Advisory only; never blocks and never participates in unlock decisions.
    Optional,
}

impl DependencyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::Required => "required",
            DependencyType::Optional => "optional",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "required" => Some(Self::Required),
            "optional" => Some(Self::Optional),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_required(self) -> bool {
        matches!(self, DependencyType::Required)
    }
}

/// Minimum score (in percent) a prerequisite must reach to satisfy an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MinScore(u8);

impl MinScore {
    pub const NONE: MinScore = MinScore(0);

    /// # Errors
    ///
    /// Returns `GraphError::InvalidMinScore` for values above 100.
    pub fn new(percent: u8) -> Result<Self, GraphError> {
        if percent > 100 {
            return Err(GraphError::InvalidMinScore(percent));
        }
        Ok(Self(percent))
    }

    #[must_use]
    pub fn percent(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_gating(self) -> bool {
        self.0 > 0
    }
}

impl TryFrom<u8> for MinScore {
    type Error = GraphError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MinScore> for u8 {
    fn from(value: MinScore) -> Self {
        value.0
    }
}

/// Directed prerequisite edge: `from` must be satisfied before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: EdgeId,
    pub graph_id: GraphId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub dependency_type: DependencyType,
    pub min_score: MinScore,
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.dependency_type.is_required()
    }

    #[must_use]
    pub fn touches(&self, node: NodeId) -> bool {
        self.from_node == node || self.to_node == node
    }
}

//
// ─── SNAPSHOT ──────────────────────────────────────────────────────────────────
//

/// Read-only view of one graph: the graph row, its nodes and its edges.
///
/// All planners in this crate operate on a snapshot so they stay pure.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    graph: Graph,
    nodes: BTreeMap<NodeId, GraphNode>,
    edges: Vec<Dependency>,
}

impl GraphSnapshot {
    /// Assemble a snapshot, checking that every node and edge belongs to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::EdgeCrossGraph` for a node or edge endpoint outside the graph.
    pub fn new(
        graph: Graph,
        nodes: Vec<GraphNode>,
        edges: Vec<Dependency>,
    ) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for node in nodes {
            if node.graph_id != graph.id {
                return Err(GraphError::EdgeCrossGraph {
                    graph: graph.id,
                    node: node.id,
                });
            }
            by_id.insert(node.id, node);
        }

        for edge in &edges {
            for endpoint in [edge.from_node, edge.to_node] {
                if edge.graph_id != graph.id || !by_id.contains_key(&endpoint) {
                    return Err(GraphError::EdgeCrossGraph {
                        graph: graph.id,
                        node: endpoint,
                    });
                }
            }
        }

        Ok(Self {
            graph,
            nodes: by_id,
            edges,
        })
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn allow_skip(&self) -> bool {
        self.graph.allow_skip
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn edges(&self) -> &[Dependency] {
        &self.edges
    }

    #[must_use]
    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<&Dependency> {
        self.edges
            .iter()
            .find(|e| e.from_node == from && e.to_node == to)
    }

    /// Required edges pointing at `node`.
    pub fn required_incoming(&self, node: NodeId) -> impl Iterator<Item = &Dependency> {
        self.edges
            .iter()
            .filter(move |e| e.to_node == node && e.is_required())
    }

    /// Required edges leaving `node`.
    pub fn required_outgoing(&self, node: NodeId) -> impl Iterator<Item = &Dependency> {
        self.edges
            .iter()
            .filter(move |e| e.from_node == node && e.is_required())
    }

    /// Directed `(from, to)` pairs for every edge regardless of type.
    #[must_use]
    pub fn adjacency_pairs(&self) -> Vec<(NodeId, NodeId)> {
        self.edges.iter().map(|e| (e.from_node, e.to_node)).collect()
    }

    /// Apply an unlock decision to the snapshot's copy of a node.
    pub(crate) fn set_unlocked(&mut self, node: NodeId, unlocked_at: Option<DateTime<Utc>>) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.set_unlocked(unlocked_at);
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
