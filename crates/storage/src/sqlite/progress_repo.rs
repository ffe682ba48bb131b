use pathway_core::model::{
    ElementProgress, GraphId, LessonProgress, NodeId, StudentId,
};
use pathway_core::unlock::UnlockChange;
use sqlx::{Executor, Row, Sqlite, SqliteConnection};

use super::SqliteRepository;
use super::mapping::{
    answer_to_json, db_err, id_i64, map_element_progress_row, map_lesson_progress_row, ser,
};
use crate::repository::{ProgressRepository, StorageError};

const ELEMENT_PROGRESS_COLUMNS: &str = "student_id, node_id, element_id, status, score, max_score, attempts, answer, started_at, completed_at";
const LESSON_PROGRESS_COLUMNS: &str = "student_id, node_id, status, completed_elements, total_elements, completion_percent, total_score, max_possible_score, started_at, completed_at";

fn students_from_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StudentId>, StorageError> {
    rows.iter()
        .map(|row| {
            let raw: i64 = row.try_get("student_id").map_err(ser)?;
            u64::try_from(raw).map(StudentId::new).map_err(ser)
        })
        .collect()
}

pub(super) async fn upsert_element_progress(
    conn: &mut SqliteConnection,
    p: &ElementProgress,
) -> Result<(), StorageError> {
    sqlx::query(
        r"
        INSERT INTO element_progress (
            student_id, node_id, element_id, status, score, max_score,
            attempts, answer, started_at, completed_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(student_id, node_id, element_id) DO UPDATE SET
            status = excluded.status,
            score = excluded.score,
            max_score = excluded.max_score,
            attempts = excluded.attempts,
            answer = excluded.answer,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at
        ",
    )
    .bind(id_i64("student_id", p.student_id.value())?)
    .bind(id_i64("node_id", p.node_id.value())?)
    .bind(id_i64("element_id", p.element_id.value())?)
    .bind(p.status.as_str())
    .bind(p.score.map(i64::from))
    .bind(i64::from(p.max_score))
    .bind(i64::from(p.attempts))
    .bind(answer_to_json(p.answer.as_ref())?)
    .bind(p.started_at)
    .bind(p.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(super) async fn upsert_lesson_progress(
    conn: &mut SqliteConnection,
    p: &LessonProgress,
) -> Result<(), StorageError> {
    sqlx::query(
        r"
        INSERT INTO lesson_progress (
            student_id, node_id, status, completed_elements, total_elements,
            completion_percent, total_score, max_possible_score, started_at, completed_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(student_id, node_id) DO UPDATE SET
            status = excluded.status,
            completed_elements = excluded.completed_elements,
            total_elements = excluded.total_elements,
            completion_percent = excluded.completion_percent,
            total_score = excluded.total_score,
            max_possible_score = excluded.max_possible_score,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at
        ",
    )
    .bind(id_i64("student_id", p.student_id.value())?)
    .bind(id_i64("node_id", p.node_id.value())?)
    .bind(p.status.as_str())
    .bind(i64::from(p.completed_elements))
    .bind(i64::from(p.total_elements))
    .bind(p.completion_percent)
    .bind(i64::from(p.total_score))
    .bind(i64::from(p.max_possible_score))
    .bind(p.started_at)
    .bind(p.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Apply lock changes; a change for a missing node fails the whole transaction.
pub(super) async fn apply_unlocks(
    conn: &mut SqliteConnection,
    unlocks: &[UnlockChange],
) -> Result<(), StorageError> {
    for change in unlocks {
        let res = sqlx::query(
            "UPDATE graph_nodes SET is_unlocked = ?2, unlocked_at = ?3 WHERE id = ?1",
        )
        .bind(id_i64("node_id", change.node_id.value())?)
        .bind(change.is_unlock())
        .bind(change.unlocked_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
    }
    Ok(())
}

pub(super) async fn fetch_element_progress<'c, E>(
    exec: E,
    student_id: StudentId,
    node_id: NodeId,
) -> Result<Vec<ElementProgress>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {ELEMENT_PROGRESS_COLUMNS} FROM element_progress
         WHERE student_id = ?1 AND node_id = ?2
         ORDER BY element_id ASC"
    ))
    .bind(id_i64("student_id", student_id.value())?)
    .bind(id_i64("node_id", node_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    rows.iter().map(map_element_progress_row).collect()
}

pub(super) async fn fetch_lesson_progress<'c, E>(
    exec: E,
    student_id: StudentId,
    graph_id: GraphId,
) -> Result<Vec<LessonProgress>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {LESSON_PROGRESS_COLUMNS} FROM lesson_progress
         WHERE student_id = ?1
           AND node_id IN (SELECT id FROM graph_nodes WHERE graph_id = ?2)
         ORDER BY node_id ASC"
    ))
    .bind(id_i64("student_id", student_id.value())?)
    .bind(id_i64("graph_id", graph_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    rows.iter().map(map_lesson_progress_row).collect()
}

pub(super) async fn fetch_students_in_graph<'c, E>(
    exec: E,
    graph_id: GraphId,
) -> Result<Vec<StudentId>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        r"
        SELECT student_id FROM lesson_progress
        WHERE node_id IN (SELECT id FROM graph_nodes WHERE graph_id = ?1)
        UNION
        SELECT student_id FROM element_progress
        WHERE node_id IN (SELECT id FROM graph_nodes WHERE graph_id = ?1)
        ORDER BY student_id ASC
        ",
    )
    .bind(id_i64("graph_id", graph_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    students_from_rows(&rows)
}

pub(super) async fn fetch_students_on_node<'c, E>(
    exec: E,
    node_id: NodeId,
) -> Result<Vec<StudentId>, StorageError>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        r"
        SELECT student_id FROM lesson_progress WHERE node_id = ?1
        UNION
        SELECT student_id FROM element_progress WHERE node_id = ?1
        ORDER BY student_id ASC
        ",
    )
    .bind(id_i64("node_id", node_id.value())?)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    students_from_rows(&rows)
}

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn list_element_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError> {
        fetch_element_progress(&self.pool, student_id, node_id).await
    }

    async fn get_lesson_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {LESSON_PROGRESS_COLUMNS} FROM lesson_progress
             WHERE student_id = ?1 AND node_id = ?2"
        ))
        .bind(id_i64("student_id", student_id.value())?)
        .bind(id_i64("node_id", node_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_lesson_progress_row).transpose()
    }

    async fn list_lesson_progress(
        &self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        fetch_lesson_progress(&self.pool, student_id, graph_id).await
    }

    async fn students_in_graph(&self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError> {
        fetch_students_in_graph(&self.pool, graph_id).await
    }

    async fn students_on_node(&self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError> {
        fetch_students_on_node(&self.pool, node_id).await
    }
}
