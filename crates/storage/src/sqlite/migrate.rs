use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates graphs, the lesson catalog, nodes, dependencies, both progress
/// tables and their indexes. Progress rows carry no foreign keys: they are
/// purged explicitly when a node is deleted so the purge can be counted.
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS graphs (
                    id INTEGER PRIMARY KEY,
                    student_id INTEGER NOT NULL,
                    subject_id INTEGER NOT NULL,
                    allow_skip INTEGER NOT NULL CHECK (allow_skip IN (0, 1)),
                    created_at TEXT NOT NULL,
                    UNIQUE (student_id, subject_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lessons (
                    id INTEGER PRIMARY KEY,
                    title TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lesson_elements (
                    id INTEGER PRIMARY KEY,
                    lesson_id INTEGER NOT NULL,
                    position INTEGER NOT NULL CHECK (position >= 0),
                    title TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('problem', 'single_choice', 'text', 'video')),
                    correct_choice TEXT,
                    max_score INTEGER NOT NULL CHECK (max_score >= 0),
                    is_required INTEGER NOT NULL CHECK (is_required IN (0, 1)),
                    FOREIGN KEY (lesson_id) REFERENCES lessons(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS graph_nodes (
                    id INTEGER PRIMARY KEY,
                    graph_id INTEGER NOT NULL,
                    lesson_id INTEGER NOT NULL,
                    is_unlocked INTEGER NOT NULL CHECK (is_unlocked IN (0, 1)),
                    unlocked_at TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE (graph_id, lesson_id),
                    FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS dependencies (
                    id INTEGER PRIMARY KEY,
                    graph_id INTEGER NOT NULL,
                    from_node INTEGER NOT NULL,
                    to_node INTEGER NOT NULL,
                    dependency_type TEXT NOT NULL CHECK (dependency_type IN ('required', 'optional')),
                    min_score INTEGER NOT NULL CHECK (min_score BETWEEN 0 AND 100),
                    created_at TEXT NOT NULL,
                    UNIQUE (from_node, to_node),
                    CHECK (from_node <> to_node),
                    FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE,
                    FOREIGN KEY (from_node) REFERENCES graph_nodes(id) ON DELETE CASCADE,
                    FOREIGN KEY (to_node) REFERENCES graph_nodes(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS element_progress (
                    student_id INTEGER NOT NULL,
                    node_id INTEGER NOT NULL,
                    element_id INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    score INTEGER,
                    max_score INTEGER NOT NULL CHECK (max_score >= 0),
                    attempts INTEGER NOT NULL CHECK (attempts >= 0),
                    answer TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    PRIMARY KEY (student_id, node_id, element_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lesson_progress (
                    student_id INTEGER NOT NULL,
                    node_id INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    completed_elements INTEGER NOT NULL CHECK (completed_elements >= 0),
                    total_elements INTEGER NOT NULL CHECK (total_elements >= 0),
                    completion_percent REAL NOT NULL,
                    total_score INTEGER NOT NULL CHECK (total_score >= 0),
                    max_possible_score INTEGER NOT NULL CHECK (max_possible_score >= 0),
                    started_at TEXT,
                    completed_at TEXT,
                    PRIMARY KEY (student_id, node_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_lesson_elements_lesson_position
                    ON lesson_elements (lesson_id, position);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_dependencies_graph
                    ON dependencies (graph_id, to_node);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_element_progress_node
                    ON element_progress (node_id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_lesson_progress_node
                    ON lesson_progress (node_id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
