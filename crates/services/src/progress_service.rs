use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pathway_core::Clock;
use pathway_core::model::{
    ElementAnswer, ElementId, ElementProgress, GraphNode, GraphSnapshot, Lesson, LessonElement,
    LessonProgress, NodeId, StudentId,
};
use pathway_core::prerequisites::{PrerequisiteCheck, check_prerequisites};
use pathway_core::unlock::{UnlockChange, plan_propagation};
use storage::repository::{
    GraphRepository, GraphTransaction, LessonCatalog, ProgressChanges, ProgressPersistence,
    ProgressRepository,
};

use crate::context::{changed_nodes, load_progress_in, load_snapshot_in};
use crate::error::ProgressServiceError;
use crate::locks::{GraphGuard, GraphLocks};

//
// ─── RESULTS ───────────────────────────────────────────────────────────────────
//

/// Outcome of a prerequisite-gated operation.
///
/// A missing prerequisite is an expected answer, not a failure, so it is a
/// value here rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum Gated<T> {
    Granted(T),
    Blocked(PrerequisiteCheck),
}

impl<T> Gated<T> {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Gated::Granted(_))
    }

    #[must_use]
    pub fn granted(self) -> Option<T> {
        match self {
            Gated::Granted(value) => Some(value),
            Gated::Blocked(_) => None,
        }
    }

    #[must_use]
    pub fn blocked(&self) -> Option<&PrerequisiteCheck> {
        match self {
            Gated::Granted(_) => None,
            Gated::Blocked(check) => Some(check),
        }
    }
}

/// Result of submitting or grading an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub element: ElementProgress,
    pub lesson: LessonProgress,
    /// The lesson moved to `completed` with this call.
    pub lesson_completed: bool,
    pub unlocked_nodes: Vec<GraphNode>,
}

/// Result of `ProgressService::complete_lesson`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub lesson_progress: LessonProgress,
    pub unlocked_nodes: Vec<GraphNode>,
}

//
// ─── CONTEXT ───────────────────────────────────────────────────────────────────
//

/// Everything an entry point reads about one node, loaded under the graph lock
/// inside the write transaction that later commits the result.
struct NodeContext {
    _guard: GraphGuard,
    student_id: StudentId,
    node: GraphNode,
    snapshot: GraphSnapshot,
    lesson: Lesson,
    progress: BTreeMap<NodeId, LessonProgress>,
}

impl NodeContext {
    fn element(&self, element_id: ElementId) -> Result<&LessonElement, ProgressServiceError> {
        self.lesson
            .element(element_id)
            .ok_or(ProgressServiceError::ElementNotFound {
                node: self.node.id,
                element: element_id,
            })
    }

    fn lesson_progress(&self) -> LessonProgress {
        self.progress
            .get(&self.node.id)
            .cloned()
            .unwrap_or_else(|| LessonProgress::new(self.student_id, self.node.id))
    }
}

//
// ─── SERVICE ───────────────────────────────────────────────────────────────────
//

/// Student-facing progress flows: starting, submitting, grading, completing.
///
/// Each call reads, plans and commits its element row, lesson row and every
/// unlock it causes in one write transaction while holding the graph lock.
#[derive(Clone)]
pub struct ProgressService {
    clock: Clock,
    graphs: Arc<dyn GraphRepository>,
    lessons: Arc<dyn LessonCatalog>,
    progress: Arc<dyn ProgressRepository>,
    persistence: Arc<dyn ProgressPersistence>,
    locks: Arc<GraphLocks>,
}

impl ProgressService {
    #[must_use]
    pub fn new(
        clock: Clock,
        graphs: Arc<dyn GraphRepository>,
        lessons: Arc<dyn LessonCatalog>,
        progress: Arc<dyn ProgressRepository>,
        persistence: Arc<dyn ProgressPersistence>,
        locks: Arc<GraphLocks>,
    ) -> Self {
        Self {
            clock,
            graphs,
            lessons,
            progress,
            persistence,
            locks,
        }
    }

    /// Start a lesson, creating its progress row on first use.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown ids and `ProgressServiceError::Storage`
    /// if persistence fails.
    pub async fn start_lesson(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Gated<LessonProgress>, ProgressServiceError> {
        let (mut ctx, mut tx) = self.load(student_id, node_id).await?;
        let lazy = match self.gate(&ctx) {
            Ok(lazy) => lazy,
            Err(check) => return Ok(Gated::Blocked(check)),
        };

        let now = self.clock.now();
        let elements = tx.list_element_progress(student_id, node_id).await?;
        let mut lesson_progress = ctx.lesson_progress();
        lesson_progress.recalculate(&ctx.lesson, &elements, now);
        lesson_progress.start(now);

        let (changes, _) = self.plan_commit(&mut ctx, lesson_progress.clone(), Vec::new(), lazy);
        tx.apply_progress(&changes).await?;
        debug!(student_id = %student_id, node_id = %node_id, "lesson started");
        Ok(Gated::Granted(lesson_progress))
    }

    /// Start an element: `not_started -> in_progress`, counting one attempt.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ElementNotFound` if the element is not in
    /// the node's lesson, plus the errors of `start_lesson`.
    pub async fn start_element(
        &self,
        student_id: StudentId,
        node_id: NodeId,
        element_id: ElementId,
    ) -> Result<Gated<ElementProgress>, ProgressServiceError> {
        let (mut ctx, mut tx) = self.load(student_id, node_id).await?;
        let max_score = ctx.element(element_id)?.max_score;
        let lazy = match self.gate(&ctx) {
            Ok(lazy) => lazy,
            Err(check) => return Ok(Gated::Blocked(check)),
        };

        let now = self.clock.now();
        let mut elements = tx.list_element_progress(student_id, node_id).await?;
        let mut element = take_element(&mut elements, element_id)
            .unwrap_or_else(|| ElementProgress::new(student_id, element_id, node_id, max_score));
        element.start(now);
        elements.push(element.clone());

        let mut lesson_progress = ctx.lesson_progress();
        lesson_progress.recalculate(&ctx.lesson, &elements, now);

        let (changes, _) = self.plan_commit(&mut ctx, lesson_progress, vec![element.clone()], lazy);
        tx.apply_progress(&changes).await?;
        debug!(student_id = %student_id, node_id = %node_id, element_id = %element_id, "element started");
        Ok(Gated::Granted(element))
    }

    /// Grade and record a submission, then aggregate the lesson and propagate
    /// unlocks if the lesson is completed.
    ///
    /// # Errors
    ///
    /// Same as `start_element`.
    pub async fn submit_element(
        &self,
        student_id: StudentId,
        node_id: NodeId,
        element_id: ElementId,
        answer: ElementAnswer,
    ) -> Result<Gated<SubmissionOutcome>, ProgressServiceError> {
        let (mut ctx, mut tx) = self.load(student_id, node_id).await?;
        let definition = ctx.element(element_id)?.clone();
        let lazy = match self.gate(&ctx) {
            Ok(lazy) => lazy,
            Err(check) => return Ok(Gated::Blocked(check)),
        };

        let now = self.clock.now();
        let mut others = tx.list_element_progress(student_id, node_id).await?;
        let mut element = take_element(&mut others, element_id).unwrap_or_else(|| {
            ElementProgress::new(student_id, element_id, node_id, definition.max_score)
        });
        let scoring = definition.kind.score(element.max_score, &answer);
        element.record_submission(scoring, answer, now);
        debug!(
            student_id = %student_id,
            element_id = %element_id,
            kind = definition.kind.as_str(),
            score = ?element.score,
            status = %element.status,
            "submission graded"
        );

        let outcome = self.aggregate(&mut ctx, tx, others, element, lazy).await?;
        Ok(Gated::Granted(outcome))
    }

    /// Set the score of a completed, manually graded submission.
    ///
    /// Not gated: graders act on work that was already submitted.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ProgressNotFound` when nothing was
    /// submitted, and `ProgressServiceError::Progress` for out-of-range scores
    /// or elements that are not completed.
    pub async fn grade_element(
        &self,
        student_id: StudentId,
        node_id: NodeId,
        element_id: ElementId,
        score: u32,
    ) -> Result<SubmissionOutcome, ProgressServiceError> {
        let (mut ctx, mut tx) = self.load(student_id, node_id).await?;
        ctx.element(element_id)?;

        let mut others = tx.list_element_progress(student_id, node_id).await?;
        let mut element =
            take_element(&mut others, element_id).ok_or(ProgressServiceError::ProgressNotFound {
                student: student_id,
                node: node_id,
            })?;
        element.apply_manual_grade(score)?;
        info!(student_id = %student_id, element_id = %element_id, score, "element graded");

        self.aggregate(&mut ctx, tx, others, element, None).await
    }

    /// Explicitly complete a lesson and propagate unlocks.
    ///
    /// This is how a lesson without required elements gets completed. For a
    /// lesson with required elements it only succeeds once all of them are done.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::LessonIncomplete` if required elements are
    /// still open, plus the errors of `start_lesson`.
    pub async fn complete_lesson(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Gated<CompletionOutcome>, ProgressServiceError> {
        let (mut ctx, mut tx) = self.load(student_id, node_id).await?;
        let lazy = match self.gate(&ctx) {
            Ok(lazy) => lazy,
            Err(check) => return Ok(Gated::Blocked(check)),
        };

        let now = self.clock.now();
        let elements = tx.list_element_progress(student_id, node_id).await?;
        let mut lesson_progress = ctx.lesson_progress();
        lesson_progress.recalculate(&ctx.lesson, &elements, now);
        if !lesson_progress.is_completed() {
            if lesson_progress.total_elements > 0 {
                return Err(ProgressServiceError::LessonIncomplete {
                    node: node_id,
                    completed: lesson_progress.completed_elements,
                    total: lesson_progress.total_elements,
                });
            }
            lesson_progress.mark_completed(now);
        }

        let (changes, unlocked_nodes) =
            self.plan_commit(&mut ctx, lesson_progress.clone(), Vec::new(), lazy);
        tx.apply_progress(&changes).await?;
        info!(
            student_id = %student_id,
            node_id = %node_id,
            unlocked = unlocked_nodes.len(),
            "lesson completed"
        );
        Ok(Gated::Granted(CompletionOutcome {
            lesson_progress,
            unlocked_nodes,
        }))
    }

    /// # Errors
    ///
    /// Returns `ProgressServiceError::ProgressNotFound` if the student never
    /// touched the lesson.
    pub async fn lesson_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<LessonProgress, ProgressServiceError> {
        self.progress
            .get_lesson_progress(student_id, node_id)
            .await?
            .ok_or(ProgressServiceError::ProgressNotFound {
                student: student_id,
                node: node_id,
            })
    }

    /// Element rows of one student on one node, ordered by element id.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::NodeNotFound` for an unknown node.
    pub async fn element_progress(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, ProgressServiceError> {
        if self.graphs.get_node(node_id).await?.is_none() {
            return Err(ProgressServiceError::NodeNotFound(node_id));
        }
        Ok(self.progress.list_element_progress(student_id, node_id).await?)
    }

    //
    // ─── INTERNALS ─────────────────────────────────────────────────────────────
    //

    async fn load(
        &self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<(NodeContext, Box<dyn GraphTransaction>), ProgressServiceError> {
        let located = self
            .graphs
            .get_node(node_id)
            .await?
            .ok_or(ProgressServiceError::NodeNotFound(node_id))?;
        let guard = self.locks.acquire(located.graph_id).await;
        // A node never changes lessons, so the catalog is read outside the transaction.
        let lesson = self
            .lessons
            .get_lesson(located.lesson_id)
            .await?
            .ok_or(ProgressServiceError::LessonNotFound(located.lesson_id))?;

        // Re-read inside the transaction: the node may have been removed meanwhile.
        let mut tx = self.persistence.begin().await?;
        let snapshot = load_snapshot_in(tx.as_mut(), located.graph_id)
            .await?
            .ok_or(ProgressServiceError::GraphNotFound(located.graph_id))?;
        let node = snapshot
            .node(node_id)
            .cloned()
            .ok_or(ProgressServiceError::NodeNotFound(node_id))?;
        let progress = load_progress_in(tx.as_mut(), student_id, node.graph_id).await?;

        let ctx = NodeContext {
            _guard: guard,
            student_id,
            node,
            snapshot,
            lesson,
            progress,
        };
        Ok((ctx, tx))
    }

    /// Access gate: an unlocked node passes; a locked node passes when its
    /// prerequisites hold, and is unlocked in the same commit.
    fn gate(&self, ctx: &NodeContext) -> Result<Option<UnlockChange>, PrerequisiteCheck> {
        if ctx.node.is_unlocked {
            return Ok(None);
        }
        let check = check_prerequisites(&ctx.snapshot, ctx.node.id, &ctx.progress);
        if check.can_start {
            debug!(student_id = %ctx.student_id, node_id = %ctx.node.id, reason = %check.reason, "locked node unlocked on access");
            Ok(Some(UnlockChange::unlock(ctx.node.id, self.clock.now())))
        } else {
            debug!(
                student_id = %ctx.student_id,
                node_id = %ctx.node.id,
                missing = check.missing.len(),
                "access blocked by prerequisites"
            );
            Err(check)
        }
    }

    /// Recompute the lesson row from an updated element row and the node's
    /// other rows, then commit both with any unlocks.
    async fn aggregate(
        &self,
        ctx: &mut NodeContext,
        tx: Box<dyn GraphTransaction>,
        mut elements: Vec<ElementProgress>,
        element: ElementProgress,
        lazy: Option<UnlockChange>,
    ) -> Result<SubmissionOutcome, ProgressServiceError> {
        let now = self.clock.now();
        elements.push(element.clone());
        let mut lesson = ctx.lesson_progress();
        let lesson_completed = lesson.recalculate(&ctx.lesson, &elements, now);

        let (changes, unlocked_nodes) =
            self.plan_commit(ctx, lesson.clone(), vec![element.clone()], lazy);
        tx.apply_progress(&changes).await?;

        if lesson_completed {
            info!(
                student_id = %ctx.student_id,
                node_id = %ctx.node.id,
                total_score = lesson.total_score,
                unlocked = unlocked_nodes.len(),
                "lesson completed"
            );
        }
        Ok(SubmissionOutcome {
            element,
            lesson,
            lesson_completed,
            unlocked_nodes,
        })
    }

    /// Assemble the commit for an updated lesson row, adding propagation when
    /// the lesson is completed. Returns the changes and the dependents they unlock.
    fn plan_commit(
        &self,
        ctx: &mut NodeContext,
        lesson_progress: LessonProgress,
        element_progress: Vec<ElementProgress>,
        lazy: Option<UnlockChange>,
    ) -> (ProgressChanges, Vec<GraphNode>) {
        let mut unlocks: Vec<UnlockChange> = lazy.into_iter().collect();
        ctx.snapshot.apply_unlocks(&unlocks);
        ctx.progress.insert(ctx.node.id, lesson_progress.clone());

        let propagated = if lesson_progress.is_completed() {
            plan_propagation(&ctx.snapshot, ctx.node.id, &ctx.progress, self.clock.now())
        } else {
            Vec::new()
        };
        let unlocked = changed_nodes(&ctx.snapshot, &propagated);
        unlocks.extend(propagated);

        (
            ProgressChanges {
                element_progress,
                lesson_progress: vec![lesson_progress],
                unlocks,
            },
            unlocked,
        )
    }
}

/// Remove and return the row for `element_id`, leaving the node's other rows.
fn take_element(
    elements: &mut Vec<ElementProgress>,
    element_id: ElementId,
) -> Option<ElementProgress> {
    let index = elements.iter().position(|e| e.element_id == element_id)?;
    Some(elements.swap_remove(index))
}
