use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::graph::MinScore;
use crate::model::ids::{ElementId, NodeId, StudentId};
use crate::model::lesson::{ElementAnswer, Lesson, Scoring};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("score {score} is outside 0..={max_score}")]
    ScoreOutOfRange { score: u32, max_score: u32 },

    #[error("element {0} has not been submitted yet")]
    ElementNotSubmitted(ElementId),

    #[error("invalid progress status: {0}")]
    InvalidStatus(String),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Shared lifecycle of element and lesson progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl ProgressStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }

    /// # Errors
    ///
    /// Returns `ProgressError::InvalidStatus` for unknown values.
    pub fn parse(value: &str) -> Result<Self, ProgressError> {
        match value {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(ProgressError::InvalidStatus(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── ELEMENT PROGRESS ──────────────────────────────────────────────────────────
//

/// A student's progress on one element of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementProgress {
    pub student_id: StudentId,
    pub element_id: ElementId,
    pub node_id: NodeId,
    pub status: ProgressStatus,
    pub score: Option<u32>,
    pub max_score: u32,
    pub attempts: u32,
    pub answer: Option<ElementAnswer>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ElementProgress {
    #[must_use]
    pub fn new(student_id: StudentId, element_id: ElementId, node_id: NodeId, max_score: u32) -> Self {
        Self {
            student_id,
            element_id,
            node_id,
            status: ProgressStatus::NotStarted,
            score: None,
            max_score,
            attempts: 0,
            answer: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ProgressStatus::Completed
    }

    /// Move `not_started -> in_progress`, counting one attempt.
    ///
    /// Returns `false` (and changes nothing) when already started.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ProgressStatus::NotStarted {
            return false;
        }
        self.status = ProgressStatus::InProgress;
        self.started_at = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        true
    }

    /// Record a graded submission.
    ///
    /// Starts the element first if needed; resubmissions never add attempts.
    /// A completed element stays completed and keeps its best score.
    pub fn record_submission(&mut self, scoring: Scoring, answer: ElementAnswer, now: DateTime<Utc>) {
        self.start(now);
        self.answer = Some(answer);

        if self.is_completed() {
            self.score = match (self.score, scoring.score) {
                (Some(old), Some(new)) => Some(old.max(new)),
                (old, new) => old.or(new),
            };
            return;
        }

        self.score = scoring.score;
        if scoring.completes {
            self.status = ProgressStatus::Completed;
            self.completed_at = Some(now);
        }
    }

    /// Set the score of a completed element by hand.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::ElementNotSubmitted` when the element is not completed,
    /// or `ProgressError::ScoreOutOfRange` when `score` exceeds `max_score`.
    pub fn apply_manual_grade(&mut self, score: u32) -> Result<(), ProgressError> {
        if !self.is_completed() {
            return Err(ProgressError::ElementNotSubmitted(self.element_id));
        }
        if score > self.max_score {
            return Err(ProgressError::ScoreOutOfRange {
                score,
                max_score: self.max_score,
            });
        }
        self.score = Some(score);
        Ok(())
    }
}

//
// ─── LESSON PROGRESS ───────────────────────────────────────────────────────────
//

/// A student's aggregated progress on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonProgress {
    pub student_id: StudentId,
    pub node_id: NodeId,
    pub status: ProgressStatus,
    pub completed_elements: u32,
    pub total_elements: u32,
    pub completion_percent: f64,
    pub total_score: u32,
    pub max_possible_score: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LessonProgress {
    #[must_use]
    pub fn new(student_id: StudentId, node_id: NodeId) -> Self {
        Self {
            student_id,
            node_id,
            status: ProgressStatus::NotStarted,
            completed_elements: 0,
            total_elements: 0,
            completion_percent: 0.0,
            total_score: 0,
            max_possible_score: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ProgressStatus::Completed
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ProgressStatus::NotStarted {
            return false;
        }
        self.status = ProgressStatus::InProgress;
        self.started_at = Some(now);
        true
    }

    /// Recompute counters from the element rows of this node.
    ///
    /// Rows for other nodes, other students or elements missing from `lesson` are
    /// ignored. Returns `true` when this call moved the lesson to `completed`.
    /// A lesson without required elements is never completed here.
    pub fn recalculate(
        &mut self,
        lesson: &Lesson,
        elements: &[ElementProgress],
        now: DateTime<Utc>,
    ) -> bool {
        let (student_id, node_id) = (self.student_id, self.node_id);
        let relevant = || {
            elements.iter().filter(move |p| {
                p.student_id == student_id
                    && p.node_id == node_id
                    && lesson.element(p.element_id).is_some()
            })
        };

        let completed_required = relevant()
            .filter(|p| p.is_completed())
            .filter(|p| lesson.element(p.element_id).is_some_and(|e| e.is_required))
            .count();

        self.completed_elements = u32::try_from(completed_required).unwrap_or(u32::MAX);
        self.total_elements = lesson.required_count();
        self.completion_percent = if self.total_elements == 0 {
            0.0
        } else {
            f64::from(self.completed_elements) / f64::from(self.total_elements) * 100.0
        };
        self.total_score = relevant()
            .filter(|p| p.is_completed())
            .filter_map(|p| p.score)
            .fold(0_u32, u32::saturating_add);
        self.max_possible_score = lesson.max_score();

        if relevant().any(|p| p.status != ProgressStatus::NotStarted) {
            self.start(now);
        }

        if self.total_elements > 0
            && self.completed_elements >= self.total_elements
            && !self.is_completed()
        {
            return self.mark_completed(now);
        }
        false
    }

    /// Force completion (used for lessons with no required elements).
    ///
    /// Returns `false` when the lesson was already completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = ProgressStatus::Completed;
        self.completed_at = Some(now);
        true
    }

    /// Score as a percentage of the maximum; 100 when nothing is scoreable.
    #[must_use]
    pub fn score_percent(&self) -> f64 {
        if self.max_possible_score == 0 {
            return 100.0;
        }
        f64::from(self.total_score) / f64::from(self.max_possible_score) * 100.0
    }

    /// Whether the score reaches `min`, compared exactly in integers.
    #[must_use]
    pub fn meets(&self, min: MinScore) -> bool {
        if !min.is_gating() || self.max_possible_score == 0 {
            return true;
        }
        u64::from(self.total_score) * 100 >= u64::from(min.percent()) * u64::from(self.max_possible_score)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
