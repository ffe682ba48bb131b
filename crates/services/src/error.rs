//! Shared error types for the services crate.

use thiserror::Error;

use pathway_core::model::{
    EdgeId, ElementId, GraphError, GraphId, LessonError, LessonId, NodeId, ProgressError,
    StudentId, SubjectId,
};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `GraphService` and the structural paths of `UnlockEngine`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphServiceError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("graph {0} not found")]
    GraphNotFound(GraphId),
    #[error("student {student} already has a graph for subject {subject}")]
    GraphAlreadyExists {
        student: StudentId,
        subject: SubjectId,
    },
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("dependency {0} not found")]
    EdgeNotFound(EdgeId),
    #[error("lesson {0} not found")]
    LessonNotFound(LessonId),
    #[error("lesson {lesson} is already part of graph {graph}")]
    LessonAlreadyInGraph { graph: GraphId, lesson: LessonId },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ProgressService` and `PrerequisiteService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error("graph {0} not found")]
    GraphNotFound(GraphId),
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("lesson {0} not found")]
    LessonNotFound(LessonId),
    #[error("element {element} is not part of the lesson on node {node}")]
    ElementNotFound { node: NodeId, element: ElementId },
    #[error("no progress recorded for student {student} on node {node}")]
    ProgressNotFound { student: StudentId, node: NodeId },
    #[error("lesson on node {node} has {completed} of {total} required elements completed")]
    LessonIncomplete {
        node: NodeId,
        completed: u32,
        total: u32,
    },
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `CatalogService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogServiceError {
    #[error(transparent)]
    Lesson(#[from] LessonError),
    #[error("lesson {0} not found")]
    LessonNotFound(LessonId),
    #[error("lesson {0} reuses an element id owned by another lesson")]
    ElementIdTaken(LessonId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
