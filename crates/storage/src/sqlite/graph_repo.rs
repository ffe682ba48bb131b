use pathway_core::model::{
    Dependency, EdgeId, Graph, GraphId, GraphNode, NodeId, StudentId, SubjectId,
};
use sqlx::{Executor, Sqlite};

use super::SqliteRepository;
use super::mapping::{db_err, id_i64, map_edge_row, map_graph_row, map_node_row};
use crate::repository::{
    GraphRepository, NewEdgeRecord, NewGraphRecord, NewNodeRecord, StorageError,
};

const GRAPH_COLUMNS: &str = "id, student_id, subject_id, allow_skip, created_at";
const NODE_COLUMNS: &str = "id, graph_id, lesson_id, is_unlocked, unlocked_at, created_at";
const EDGE_COLUMNS: &str =
    "id, graph_id, from_node, to_node, dependency_type, min_score, created_at";

fn rowid(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(super) async fn fetch_graph<'c, E>(exec: E, id: GraphId) -> Result<Option<Graph>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {GRAPH_COLUMNS} FROM graphs WHERE id = ?1"))
        .bind(id_i64("graph_id", id.value())?)
        .fetch_optional(exec)
        .await
        .map_err(db_err)?;

    row.as_ref().map(map_graph_row).transpose()
}

pub(super) async fn fetch_node<'c, E>(exec: E, id: NodeId) -> Result<Option<GraphNode>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM graph_nodes WHERE id = ?1"))
        .bind(id_i64("node_id", id.value())?)
        .fetch_optional(exec)
        .await
        .map_err(db_err)?;

    row.as_ref().map(map_node_row).transpose()
}

pub(super) async fn fetch_nodes<'c, E>(exec: E, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {NODE_COLUMNS} FROM graph_nodes WHERE graph_id = ?1 ORDER BY id ASC"
    ))
    .bind(id_i64("graph_id", graph_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    rows.iter().map(map_node_row).collect()
}

pub(super) async fn fetch_edges<'c, E>(exec: E, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {EDGE_COLUMNS} FROM dependencies WHERE graph_id = ?1 ORDER BY id ASC"
    ))
    .bind(id_i64("graph_id", graph_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    rows.iter().map(map_edge_row).collect()
}

pub(super) async fn insert_edge_row<'c, E>(exec: E, edge: NewEdgeRecord) -> Result<Dependency, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    // Both endpoints must be nodes of the edge's graph; otherwise nothing is inserted.
    let res = sqlx::query(
        r"
        INSERT INTO dependencies (graph_id, from_node, to_node, dependency_type, min_score, created_at)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6
        WHERE (SELECT COUNT(*) FROM graph_nodes WHERE graph_id = ?1 AND id IN (?2, ?3)) = 2
        ",
    )
    .bind(id_i64("graph_id", edge.graph_id.value())?)
    .bind(id_i64("from_node", edge.from_node.value())?)
    .bind(id_i64("to_node", edge.to_node.value())?)
    .bind(edge.dependency_type.as_str())
    .bind(i64::from(edge.min_score.percent()))
    .bind(edge.created_at)
    .execute(exec)
    .await
    .map_err(db_err)?;

    if res.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    let id = EdgeId::new(rowid("edge_id", res.last_insert_rowid())?);
    tracing::debug!(edge_id = %id, from = %edge.from_node, to = %edge.to_node, "edge inserted");
    Ok(Dependency {
        id,
        graph_id: edge.graph_id,
        from_node: edge.from_node,
        to_node: edge.to_node,
        dependency_type: edge.dependency_type,
        min_score: edge.min_score,
        created_at: edge.created_at,
    })
}

#[async_trait::async_trait]
impl GraphRepository for SqliteRepository {
    async fn insert_graph(&self, graph: NewGraphRecord) -> Result<Graph, StorageError> {
        let res = sqlx::query(
            r"
            INSERT INTO graphs (student_id, subject_id, allow_skip, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(id_i64("student_id", graph.student_id.value())?)
        .bind(id_i64("subject_id", graph.subject_id.value())?)
        .bind(graph.allow_skip)
        .bind(graph.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = GraphId::new(rowid("graph_id", res.last_insert_rowid())?);
        tracing::debug!(graph_id = %id, student_id = %graph.student_id, "graph inserted");
        Ok(Graph {
            id,
            student_id: graph.student_id,
            subject_id: graph.subject_id,
            allow_skip: graph.allow_skip,
            created_at: graph.created_at,
        })
    }

    async fn get_graph(&self, id: GraphId) -> Result<Option<Graph>, StorageError> {
        fetch_graph(&self.pool, id).await
    }

    async fn find_graph(
        &self,
        student_id: StudentId,
        subject_id: SubjectId,
    ) -> Result<Option<Graph>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {GRAPH_COLUMNS} FROM graphs WHERE student_id = ?1 AND subject_id = ?2"
        ))
        .bind(id_i64("student_id", student_id.value())?)
        .bind(id_i64("subject_id", subject_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_graph_row).transpose()
    }

    async fn insert_node(&self, node: NewNodeRecord) -> Result<GraphNode, StorageError> {
        let res = sqlx::query(
            r"
            INSERT INTO graph_nodes (graph_id, lesson_id, is_unlocked, unlocked_at, created_at)
            VALUES (?1, ?2, 0, NULL, ?3)
            ",
        )
        .bind(id_i64("graph_id", node.graph_id.value())?)
        .bind(id_i64("lesson_id", node.lesson_id.value())?)
        .bind(node.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = NodeId::new(rowid("node_id", res.last_insert_rowid())?);
        tracing::debug!(node_id = %id, graph_id = %node.graph_id, lesson_id = %node.lesson_id, "node inserted");
        Ok(GraphNode {
            id,
            graph_id: node.graph_id,
            lesson_id: node.lesson_id,
            is_unlocked: false,
            unlocked_at: None,
            created_at: node.created_at,
        })
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StorageError> {
        fetch_node(&self.pool, id).await
    }

    async fn list_nodes(&self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError> {
        fetch_nodes(&self.pool, graph_id).await
    }

    async fn insert_edge(&self, edge: NewEdgeRecord) -> Result<Dependency, StorageError> {
        insert_edge_row(&self.pool, edge).await
    }

    async fn get_edge(&self, id: EdgeId) -> Result<Option<Dependency>, StorageError> {
        let row = sqlx::query(&format!("SELECT {EDGE_COLUMNS} FROM dependencies WHERE id = ?1"))
            .bind(id_i64("edge_id", id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(map_edge_row).transpose()
    }

    async fn list_edges(&self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError> {
        fetch_edges(&self.pool, graph_id).await
    }
}
