use std::sync::Arc;

use tracing::info;

use pathway_core::model::{Lesson, LessonId};
use storage::repository::{LessonCatalog, StorageError};

use crate::error::CatalogServiceError;

/// Maximum number of lessons returned by `CatalogService::list_lessons`.
pub const DEFAULT_LIST_LIMIT: u32 = 500;

/// Maintains the lesson catalog that graph nodes point into.
#[derive(Clone)]
pub struct CatalogService {
    lessons: Arc<dyn LessonCatalog>,
}

impl CatalogService {
    #[must_use]
    pub fn new(lessons: Arc<dyn LessonCatalog>) -> Self {
        Self { lessons }
    }

    /// Insert or replace a lesson and its elements.
    ///
    /// The lesson is re-validated first, so values that skipped `Lesson::new`
    /// (for example deserialized ones) are checked too.
    ///
    /// # Errors
    ///
    /// Returns `CatalogServiceError::Lesson` for invalid lessons and
    /// `CatalogServiceError::ElementIdTaken` when an element id is in use elsewhere.
    pub async fn upsert_lesson(&self, lesson: Lesson) -> Result<Lesson, CatalogServiceError> {
        let lesson = Lesson::new(lesson.id(), lesson.title(), lesson.elements().to_vec())?;
        self.lessons
            .upsert_lesson(&lesson)
            .await
            .map_err(|e| match e {
                StorageError::Conflict => CatalogServiceError::ElementIdTaken(lesson.id()),
                other => other.into(),
            })?;
        info!(lesson_id = %lesson.id(), elements = lesson.elements().len(), "lesson saved");
        Ok(lesson)
    }

    /// Upsert several lessons in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Same as `upsert_lesson`.
    pub async fn seed(&self, lessons: Vec<Lesson>) -> Result<usize, CatalogServiceError> {
        let mut saved = 0;
        for lesson in lessons {
            self.upsert_lesson(lesson).await?;
            saved += 1;
        }
        Ok(saved)
    }

    /// # Errors
    ///
    /// Returns `CatalogServiceError::LessonNotFound` for an unknown lesson.
    pub async fn lesson(&self, lesson_id: LessonId) -> Result<Lesson, CatalogServiceError> {
        self.lessons
            .get_lesson(lesson_id)
            .await?
            .ok_or(CatalogServiceError::LessonNotFound(lesson_id))
    }

    /// Lessons ordered by id, up to `DEFAULT_LIST_LIMIT`.
    ///
    /// # Errors
    ///
    /// Returns `CatalogServiceError::Storage` if repository access fails.
    pub async fn list_lessons(&self) -> Result<Vec<Lesson>, CatalogServiceError> {
        Ok(self.lessons.list_lessons(DEFAULT_LIST_LIMIT).await?)
    }
}
