use std::collections::BTreeMap;

use pathway_core::model::{Lesson, LessonElement, LessonId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{db_err, id_i64, kind_columns, map_element_row, ser};
use crate::repository::{LessonCatalog, StorageError};

const ELEMENT_COLUMNS: &str =
    "id, lesson_id, position, title, kind, correct_choice, max_score, is_required";

#[async_trait::async_trait]
impl LessonCatalog for SqliteRepository {
    async fn upsert_lesson(&self, lesson: &Lesson) -> Result<(), StorageError> {
        let lesson_id = id_i64("lesson_id", lesson.id().value())?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r"
            INSERT INTO lessons (id, title) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET title = excluded.title
            ",
        )
        .bind(lesson_id)
        .bind(lesson.title())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM lesson_elements WHERE lesson_id = ?1")
            .bind(lesson_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for element in lesson.elements() {
            let (kind, correct_choice) = kind_columns(&element.kind);
            sqlx::query(
                r"
                INSERT INTO lesson_elements (id, lesson_id, position, title, kind, correct_choice, max_score, is_required)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )
            .bind(id_i64("element_id", element.id.value())?)
            .bind(lesson_id)
            .bind(i64::from(element.position))
            .bind(element.title.as_str())
            .bind(kind)
            .bind(correct_choice)
            .bind(i64::from(element.max_score))
            .bind(element.is_required)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(lesson_id = %lesson.id(), elements = lesson.elements().len(), "lesson upserted");
        Ok(())
    }

    async fn get_lesson(&self, id: LessonId) -> Result<Option<Lesson>, StorageError> {
        let lesson_id = id_i64("lesson_id", id.value())?;
        let Some(row) = sqlx::query("SELECT id, title FROM lessons WHERE id = ?1")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let title: String = row.try_get("title").map_err(ser)?;

        let rows = sqlx::query(&format!(
            "SELECT {ELEMENT_COLUMNS} FROM lesson_elements WHERE lesson_id = ?1 ORDER BY position ASC, id ASC"
        ))
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let elements = rows
            .iter()
            .map(map_element_row)
            .collect::<Result<Vec<_>, _>>()?;

        Lesson::new(id, title, elements).map(Some).map_err(ser)
    }

    async fn list_lessons(&self, limit: u32) -> Result<Vec<Lesson>, StorageError> {
        let rows = sqlx::query("SELECT id, title FROM lessons ORDER BY id ASC LIMIT ?1")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let element_rows = sqlx::query(&format!(
            r"
            SELECT {ELEMENT_COLUMNS} FROM lesson_elements
            WHERE lesson_id IN (SELECT id FROM lessons ORDER BY id ASC LIMIT ?1)
            ORDER BY lesson_id ASC, position ASC, id ASC
            "
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut by_lesson: BTreeMap<LessonId, Vec<LessonElement>> = BTreeMap::new();
        for row in &element_rows {
            let element = map_element_row(row)?;
            by_lesson.entry(element.lesson_id).or_default().push(element);
        }

        let mut lessons = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_id: i64 = row.try_get("id").map_err(ser)?;
            let id = LessonId::new(u64::try_from(raw_id).map_err(ser)?);
            let title: String = row.try_get("title").map_err(ser)?;
            let elements = by_lesson.remove(&id).unwrap_or_default();
            lessons.push(Lesson::new(id, title, elements).map_err(ser)?);
        }
        Ok(lessons)
    }
}
