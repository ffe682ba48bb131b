use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{ElementId, LessonId};

/// Watched fraction at or above which a video earns full credit.
pub const FULL_CREDIT_WATCH_FRACTION: f64 = 0.90;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LessonError {
    #[error("lesson title cannot be empty")]
    EmptyTitle,

    #[error("element {element} belongs to lesson {actual}, expected {expected}")]
    ForeignElement {
        element: ElementId,
        expected: LessonId,
        actual: LessonId,
    },

    #[error("element {0} appears more than once")]
    DuplicateElement(ElementId),

    #[error("single-choice element {0} has no correct choice")]
    MissingCorrectChoice(ElementId),
}

//
// ─── ELEMENT KIND ──────────────────────────────────────────────────────────────
//

/// The four kinds of lesson element, each with its own scoring rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    /// Free-form problem; graded by a human later.
    Problem,
    /// Auto-graded question with exactly one correct choice.
    SingleChoice { correct_choice: String },
    /// Reading material; credit for viewing it.
    Text,
    /// Media to watch; partial credit by watched fraction.
    Video,
}

/// Score and completion decision produced by grading one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scoring {
    /// `None` when grading is deferred to a human.
    pub score: Option<u32>,
    /// Whether the submission completes the element.
    pub completes: bool,
}

impl ElementKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Problem => "problem",
            ElementKind::SingleChoice { .. } => "single_choice",
            ElementKind::Text => "text",
            ElementKind::Video => "video",
        }
    }

    /// Grade a submission against `max_score`.
    #[must_use]
    pub fn score(&self, max_score: u32, answer: &ElementAnswer) -> Scoring {
        match self {
            ElementKind::Problem => Scoring {
                score: None,
                completes: true,
            },
            ElementKind::SingleChoice { correct_choice } => {
                let correct = answer
                    .choice
                    .as_deref()
                    .is_some_and(|c| c.trim() == correct_choice.trim());
                // A wrong choice leaves the element open so the student can retry.
                Scoring {
                    score: Some(if correct { max_score } else { 0 }),
                    completes: correct,
                }
            }
            ElementKind::Text => Scoring {
                score: Some(if answer.viewed { max_score } else { 0 }),
                completes: true,
            },
            ElementKind::Video => Scoring {
                score: Some(watch_credit(max_score, answer.watched_fraction.unwrap_or(0.0))),
                completes: true,
            },
        }
    }
}

fn watch_credit(max_score: u32, fraction: f64) -> u32 {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    if fraction >= FULL_CREDIT_WATCH_FRACTION {
        return max_score;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let credit = (fraction * f64::from(max_score)).round() as u32;
    credit.min(max_score)
}

//
// ─── ANSWER ────────────────────────────────────────────────────────────────────
//

/// A student's submission for one element, stored verbatim for review.
///
/// Fields are optional so any kind can be graded from the same shape; fields
/// a kind does not look at are kept but ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default)]
    pub viewed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_fraction: Option<f64>,
}

impl ElementAnswer {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn choice(choice: impl Into<String>) -> Self {
        Self {
            choice: Some(choice.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn viewed() -> Self {
        Self {
            viewed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn watched(fraction: f64) -> Self {
        Self {
            watched_fraction: Some(fraction),
            ..Self::default()
        }
    }
}

//
// ─── LESSON ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonElement {
    pub id: ElementId,
    pub lesson_id: LessonId,
    pub position: u32,
    pub title: String,
    #[serde(flatten)]
    pub kind: ElementKind,
    pub max_score: u32,
    /// Only required elements count towards lesson completion.
    pub is_required: bool,
}

/// Lesson definition from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    id: LessonId,
    title: String,
    elements: Vec<LessonElement>,
}

impl Lesson {
    /// Build a lesson, ordering elements by position.
    ///
    /// # Errors
    ///
    /// Returns `LessonError` if the title is blank, an element belongs to another
    /// lesson, an element id repeats, or a single-choice element has no answer key.
    pub fn new(
        id: LessonId,
        title: impl Into<String>,
        mut elements: Vec<LessonElement>,
    ) -> Result<Self, LessonError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(LessonError::EmptyTitle);
        }

        for (i, element) in elements.iter().enumerate() {
            if element.lesson_id != id {
                return Err(LessonError::ForeignElement {
                    element: element.id,
                    expected: id,
                    actual: element.lesson_id,
                });
            }
            if elements[..i].iter().any(|e| e.id == element.id) {
                return Err(LessonError::DuplicateElement(element.id));
            }
            if let ElementKind::SingleChoice { correct_choice } = &element.kind {
                if correct_choice.trim().is_empty() {
                    return Err(LessonError::MissingCorrectChoice(element.id));
                }
            }
        }

        elements.sort_by_key(|e| (e.position, e.id));
        Ok(Self {
            id,
            title,
            elements,
        })
    }

    #[must_use]
    pub fn id(&self) -> LessonId {
        self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn elements(&self) -> &[LessonElement] {
        &self.elements
    }

    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<&LessonElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn required_elements(&self) -> impl Iterator<Item = &LessonElement> {
        self.elements.iter().filter(|e| e.is_required)
    }

    #[must_use]
    pub fn required_count(&self) -> u32 {
        u32::try_from(self.required_elements().count()).unwrap_or(u32::MAX)
    }

    /// Sum of every element's max score.
    #[must_use]
    pub fn max_score(&self) -> u32 {
        self.elements
            .iter()
            .fold(0_u32, |acc, e| acc.saturating_add(e.max_score))
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
