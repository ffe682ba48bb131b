use pathway_core::model::{
    Dependency, DependencyType, EdgeId, ElementAnswer, ElementId, ElementKind, ElementProgress,
    Graph, GraphId, GraphNode, LessonElement, LessonId, LessonProgress, MinScore, NodeId,
    ProgressStatus, StudentId, SubjectId,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Map driver errors, surfacing constraint violations as domain outcomes.
pub(crate) fn db_err(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::Conflict;
        }
        if db.is_foreign_key_violation() {
            return StorageError::NotFound;
        }
    }
    StorageError::Connection(e.to_string())
}

pub(crate) fn id_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

fn get_u64(row: &SqliteRow, field: &'static str) -> Result<u64, StorageError> {
    i64_to_u64(field, row.try_get::<i64, _>(field).map_err(ser)?)
}

fn get_u32(row: &SqliteRow, field: &'static str) -> Result<u32, StorageError> {
    u32_from_i64(field, row.try_get::<i64, _>(field).map_err(ser)?)
}

fn get_status(row: &SqliteRow) -> Result<ProgressStatus, StorageError> {
    let raw: String = row.try_get("status").map_err(ser)?;
    ProgressStatus::parse(&raw).map_err(ser)
}

pub(crate) fn map_graph_row(row: &SqliteRow) -> Result<Graph, StorageError> {
    Ok(Graph {
        id: GraphId::new(get_u64(row, "id")?),
        student_id: StudentId::new(get_u64(row, "student_id")?),
        subject_id: SubjectId::new(get_u64(row, "subject_id")?),
        allow_skip: row.try_get("allow_skip").map_err(ser)?,
        created_at: row.try_get("created_at").map_err(ser)?,
    })
}

pub(crate) fn map_node_row(row: &SqliteRow) -> Result<GraphNode, StorageError> {
    Ok(GraphNode {
        id: NodeId::new(get_u64(row, "id")?),
        graph_id: GraphId::new(get_u64(row, "graph_id")?),
        lesson_id: LessonId::new(get_u64(row, "lesson_id")?),
        is_unlocked: row.try_get("is_unlocked").map_err(ser)?,
        unlocked_at: row.try_get("unlocked_at").map_err(ser)?,
        created_at: row.try_get("created_at").map_err(ser)?,
    })
}

pub(crate) fn map_edge_row(row: &SqliteRow) -> Result<Dependency, StorageError> {
    let kind: String = row.try_get("dependency_type").map_err(ser)?;
    let dependency_type = DependencyType::parse(&kind)
        .ok_or_else(|| StorageError::Serialization(format!("invalid dependency_type: {kind}")))?;
    let min_score: i64 = row.try_get("min_score").map_err(ser)?;
    let min_score = u8::try_from(min_score)
        .map_err(ser)
        .and_then(|p| MinScore::new(p).map_err(ser))?;

    Ok(Dependency {
        id: EdgeId::new(get_u64(row, "id")?),
        graph_id: GraphId::new(get_u64(row, "graph_id")?),
        from_node: NodeId::new(get_u64(row, "from_node")?),
        to_node: NodeId::new(get_u64(row, "to_node")?),
        dependency_type,
        min_score,
        created_at: row.try_get("created_at").map_err(ser)?,
    })
}

/// Split an element kind into its `(kind, correct_choice)` columns.
pub(crate) fn kind_columns(kind: &ElementKind) -> (&'static str, Option<&str>) {
    match kind {
        ElementKind::SingleChoice { correct_choice } => (kind.as_str(), Some(correct_choice.as_str())),
        other => (other.as_str(), None),
    }
}

fn parse_kind(kind: &str, correct_choice: Option<String>) -> Result<ElementKind, StorageError> {
    match kind {
        "problem" => Ok(ElementKind::Problem),
        "text" => Ok(ElementKind::Text),
        "video" => Ok(ElementKind::Video),
        "single_choice" => correct_choice
            .map(|correct_choice| ElementKind::SingleChoice { correct_choice })
            .ok_or_else(|| StorageError::Serialization("missing correct_choice".into())),
        other => Err(StorageError::Serialization(format!("invalid element kind: {other}"))),
    }
}

pub(crate) fn map_element_row(row: &SqliteRow) -> Result<LessonElement, StorageError> {
    let kind: String = row.try_get("kind").map_err(ser)?;
    let correct_choice: Option<String> = row.try_get("correct_choice").map_err(ser)?;

    Ok(LessonElement {
        id: ElementId::new(get_u64(row, "id")?),
        lesson_id: LessonId::new(get_u64(row, "lesson_id")?),
        position: get_u32(row, "position")?,
        title: row.try_get("title").map_err(ser)?,
        kind: parse_kind(&kind, correct_choice)?,
        max_score: get_u32(row, "max_score")?,
        is_required: row.try_get("is_required").map_err(ser)?,
    })
}

pub(crate) fn answer_to_json(answer: Option<&ElementAnswer>) -> Result<Option<String>, StorageError> {
    answer.map(|a| serde_json::to_string(a).map_err(ser)).transpose()
}

pub(crate) fn map_element_progress_row(row: &SqliteRow) -> Result<ElementProgress, StorageError> {
    let score = row
        .try_get::<Option<i64>, _>("score")
        .map_err(ser)?
        .map(|v| u32_from_i64("score", v))
        .transpose()?;
    let answer = row
        .try_get::<Option<String>, _>("answer")
        .map_err(ser)?
        .map(|raw| serde_json::from_str::<ElementAnswer>(&raw).map_err(ser))
        .transpose()?;

    Ok(ElementProgress {
        student_id: StudentId::new(get_u64(row, "student_id")?),
        element_id: ElementId::new(get_u64(row, "element_id")?),
        node_id: NodeId::new(get_u64(row, "node_id")?),
        status: get_status(row)?,
        score,
        max_score: get_u32(row, "max_score")?,
        attempts: get_u32(row, "attempts")?,
        answer,
        started_at: row.try_get("started_at").map_err(ser)?,
        completed_at: row.try_get("completed_at").map_err(ser)?,
    })
}

pub(crate) fn map_lesson_progress_row(row: &SqliteRow) -> Result<LessonProgress, StorageError> {
    Ok(LessonProgress {
        student_id: StudentId::new(get_u64(row, "student_id")?),
        node_id: NodeId::new(get_u64(row, "node_id")?),
        status: get_status(row)?,
        completed_elements: get_u32(row, "completed_elements")?,
        total_elements: get_u32(row, "total_elements")?,
        completion_percent: row.try_get("completion_percent").map_err(ser)?,
        total_score: get_u32(row, "total_score")?,
        max_possible_score: get_u32(row, "max_possible_score")?,
        started_at: row.try_get("started_at").map_err(ser)?,
        completed_at: row.try_get("completed_at").map_err(ser)?,
    })
}
