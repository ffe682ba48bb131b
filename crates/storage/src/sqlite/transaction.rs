use pathway_core::model::{
    Dependency, ElementProgress, Graph, GraphId, GraphNode, LessonProgress, NodeId, StudentId,
};
use sqlx::{Sqlite, Transaction};

use super::SqliteRepository;
use super::graph_repo::{fetch_edges, fetch_graph, fetch_node, fetch_nodes, insert_edge_row};
use super::mapping::{db_err, id_i64};
use super::progress_repo::{
    apply_unlocks, fetch_element_progress, fetch_lesson_progress, fetch_students_in_graph,
    fetch_students_on_node, upsert_element_progress, upsert_lesson_progress,
};
use crate::repository::{
    EdgeRemoval, GraphTransaction, NewEdgeRecord, NodeRemoval, ProgressChanges,
    ProgressPersistence, RemovalCounts, StorageError,
};

/// Takes the database write lock up front; other writers, including other
/// processes, wait on `busy_timeout` until this transaction ends.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// A write transaction holding the `SQLite` reserved lock from its first statement.
struct SqliteGraphTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait::async_trait]
impl ProgressPersistence for SqliteRepository {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError> {
        let tx = self.pool.begin_with(BEGIN_WRITE).await.map_err(db_err)?;
        Ok(Box::new(SqliteGraphTransaction { tx }))
    }
}

#[async_trait::async_trait]
impl GraphTransaction for SqliteGraphTransaction {
    async fn get_graph(&mut self, id: GraphId) -> Result<Option<Graph>, StorageError> {
        fetch_graph(&mut *self.tx, id).await
    }

    async fn get_node(&mut self, id: NodeId) -> Result<Option<GraphNode>, StorageError> {
        fetch_node(&mut *self.tx, id).await
    }

    async fn list_nodes(&mut self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError> {
        fetch_nodes(&mut *self.tx, graph_id).await
    }

    async fn list_edges(&mut self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError> {
        fetch_edges(&mut *self.tx, graph_id).await
    }

    async fn list_element_progress(
        &mut self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError> {
        fetch_element_progress(&mut *self.tx, student_id, node_id).await
    }

    async fn list_lesson_progress(
        &mut self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        fetch_lesson_progress(&mut *self.tx, student_id, graph_id).await
    }

    async fn students_in_graph(&mut self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError> {
        fetch_students_in_graph(&mut *self.tx, graph_id).await
    }

    async fn students_on_node(&mut self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError> {
        fetch_students_on_node(&mut *self.tx, node_id).await
    }

    async fn insert_edge(self: Box<Self>, edge: NewEdgeRecord) -> Result<Dependency, StorageError> {
        let Self { mut tx } = *self;
        let stored = insert_edge_row(&mut *tx, edge).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn apply_progress(self: Box<Self>, changes: &ProgressChanges) -> Result<(), StorageError> {
        let Self { mut tx } = *self;

        for p in &changes.element_progress {
            upsert_element_progress(&mut tx, p).await?;
        }
        for p in &changes.lesson_progress {
            upsert_lesson_progress(&mut tx, p).await?;
        }
        apply_unlocks(&mut tx, &changes.unlocks).await?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(
            element_rows = changes.element_progress.len(),
            lesson_rows = changes.lesson_progress.len(),
            unlocks = changes.unlocks.len(),
            "progress committed"
        );
        Ok(())
    }

    async fn apply_edge_removal(self: Box<Self>, removal: &EdgeRemoval) -> Result<(), StorageError> {
        let Self { mut tx } = *self;

        let res = sqlx::query("DELETE FROM dependencies WHERE id = ?1")
            .bind(id_i64("edge_id", removal.edge_id.value())?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        apply_unlocks(&mut tx, &removal.unlocks).await?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(edge_id = %removal.edge_id, unlocks = removal.unlocks.len(), "edge removed");
        Ok(())
    }

    async fn apply_node_removal(
        self: Box<Self>,
        removal: &NodeRemoval,
    ) -> Result<RemovalCounts, StorageError> {
        if removal.unlocks.iter().any(|u| u.node_id == removal.node_id) {
            return Err(StorageError::Conflict);
        }
        let node_id = id_i64("node_id", removal.node_id.value())?;
        let Self { mut tx } = *self;

        let element_progress_removed = sqlx::query("DELETE FROM element_progress WHERE node_id = ?1")
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let lesson_progress_removed = sqlx::query("DELETE FROM lesson_progress WHERE node_id = ?1")
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        // Deleted explicitly rather than by cascade so the count is observable.
        let edges_removed =
            sqlx::query("DELETE FROM dependencies WHERE from_node = ?1 OR to_node = ?1")
                .bind(node_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();

        let node_removed = sqlx::query("DELETE FROM graph_nodes WHERE id = ?1 AND graph_id = ?2")
            .bind(node_id)
            .bind(id_i64("graph_id", removal.graph_id.value())?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected()
            > 0;

        apply_unlocks(&mut tx, &removal.unlocks).await?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(
            node_id = %removal.node_id,
            node_removed,
            edges_removed,
            lesson_progress_removed,
            element_progress_removed,
            "node removed"
        );
        Ok(RemovalCounts {
            node_removed,
            edges_removed,
            lesson_progress_removed,
            element_progress_removed,
        })
    }
}
