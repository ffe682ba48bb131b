use std::sync::Arc;

use pathway_core::model::{NodeId, StudentId};
use pathway_core::prerequisites::{PrerequisiteCheck, check_prerequisites};
use storage::repository::{GraphRepository, ProgressRepository};

use crate::context::{load_progress, load_snapshot};
use crate::error::ProgressServiceError;

/// Read-only "can I start this lesson" queries.
#[derive(Clone)]
pub struct PrerequisiteService {
    graphs: Arc<dyn GraphRepository>,
    progress: Arc<dyn ProgressRepository>,
}

impl PrerequisiteService {
    #[must_use]
    pub fn new(graphs: Arc<dyn GraphRepository>, progress: Arc<dyn ProgressRepository>) -> Self {
        Self { graphs, progress }
    }

    /// Evaluate every required prerequisite of `node_id` for `student_id`.
    ///
    /// Has no side effects; the node's stored lock flag is not consulted.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::NodeNotFound`/`GraphNotFound` for unknown
    /// ids and `ProgressServiceError::Storage` if reads fail.
    pub async fn can_start(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<PrerequisiteCheck, ProgressServiceError> {
        let node = self
            .graphs
            .get_node(node_id)
            .await?
            .ok_or(ProgressServiceError::NodeNotFound(node_id))?;
        let snapshot = load_snapshot(self.graphs.as_ref(), node.graph_id)
            .await?
            .ok_or(ProgressServiceError::GraphNotFound(node.graph_id))?;
        let progress = load_progress(self.progress.as_ref(), student_id, node.graph_id).await?;

        Ok(check_prerequisites(&snapshot, node_id, &progress))
    }
}
