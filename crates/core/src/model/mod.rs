mod graph;
mod ids;
mod lesson;
mod progress;

pub use ids::{EdgeId, ElementId, GraphId, LessonId, NodeId, ParseIdError, StudentId, SubjectId};

pub use graph::{Dependency, DependencyType, Graph, GraphError, GraphNode, GraphSnapshot, MinScore};
pub use lesson::{
    ElementAnswer, ElementKind, FULL_CREDIT_WATCH_FRACTION, Lesson, LessonElement, LessonError,
    Scoring,
};
pub use progress::{ElementProgress, LessonProgress, ProgressError, ProgressStatus};
