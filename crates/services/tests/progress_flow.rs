use std::sync::Arc;

use async_trait::async_trait;

use pathway_core::model::{
    Dependency, DependencyType, ElementAnswer, ElementId, ElementKind, ElementProgress, Graph,
    GraphId, GraphNode, Lesson, LessonElement, LessonId, LessonProgress, NodeId, ProgressStatus,
    StudentId, SubjectId,
};
use pathway_core::prerequisites::{MissingKind, StartReason};
use pathway_core::time::fixed_now;
use services::{AppServices, Clock, ProgressServiceError};
use storage::repository::{
    EdgeRemoval, GraphTransaction, InMemoryRepository, NewEdgeRecord, NodeRemoval,
    ProgressChanges, ProgressPersistence, ProgressRepository, RemovalCounts, Storage,
    StorageError,
};

fn student() -> StudentId {
    StudentId::new(3)
}

fn element(lesson: u64, slot: u64, kind: ElementKind, max_score: u32) -> LessonElement {
    LessonElement {
        id: ElementId::new(lesson * 100 + slot),
        lesson_id: LessonId::new(lesson),
        position: u32::try_from(slot).unwrap(),
        title: format!("element {slot}"),
        kind,
        max_score,
        is_required: true,
    }
}

fn quiz() -> ElementKind {
    ElementKind::SingleChoice {
        correct_choice: "b".to_string(),
    }
}

/// Lesson 1: one quiz. Lesson 2: a problem and a reading, 10 points each.
/// Lesson 3: two quizzes. Lesson 4: one quiz. Lesson 5: no elements.
fn catalog() -> Vec<Lesson> {
    vec![
        Lesson::new(LessonId::new(1), "Counting", vec![element(1, 1, quiz(), 10)]).unwrap(),
        Lesson::new(
            LessonId::new(2),
            "Proofs",
            vec![
                element(2, 1, ElementKind::Problem, 10),
                element(2, 2, ElementKind::Text, 10),
            ],
        )
        .unwrap(),
        Lesson::new(
            LessonId::new(3),
            "Sets",
            vec![element(3, 1, quiz(), 5), element(3, 2, quiz(), 5)],
        )
        .unwrap(),
        Lesson::new(LessonId::new(4), "Functions", vec![element(4, 1, quiz(), 10)]).unwrap(),
        Lesson::new(LessonId::new(5), "Welcome", Vec::new()).unwrap(),
    ]
}

fn el(lesson: u64, slot: u64) -> ElementId {
    ElementId::new(lesson * 100 + slot)
}

/// Graph over the given lessons with `edges` as (from index, to index, min score).
async fn build(
    app: &AppServices,
    allow_skip: bool,
    lessons: &[u64],
    edges: &[(usize, usize, u8)],
) -> (Graph, Vec<NodeId>) {
    app.catalog().seed(catalog()).await.expect("seed");
    let graph = app
        .graphs()
        .create_graph(student(), SubjectId::new(1), allow_skip)
        .await
        .expect("graph");
    let mut ids = Vec::new();
    for &lesson in lessons {
        ids.push(
            app.graphs()
                .add_node(graph.id, LessonId::new(lesson))
                .await
                .expect("node")
                .id,
        );
    }
    for &(from, to, min) in edges {
        app.graphs()
            .add_dependency(graph.id, ids[from], ids[to], DependencyType::Required, min)
            .await
            .expect("edge");
    }
    app.unlock_engine()
        .initialize_graph(graph.id)
        .await
        .expect("initialize");
    (graph, ids)
}

fn memory() -> AppServices {
    AppServices::in_memory(Clock::fixed(fixed_now()))
}

async fn is_unlocked(app: &AppServices, graph: &Graph, node: NodeId) -> bool {
    app.graphs()
        .snapshot(graph.id)
        .await
        .unwrap()
        .node(node)
        .is_some_and(|n| n.is_unlocked)
}

#[tokio::test]
async fn locked_lesson_is_blocked_until_prerequisite_completes() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[1, 4], &[(0, 1, 0)]).await;
    let progress = app.progress();

    let blocked = progress.start_lesson(student(), ids[1]).await.unwrap();
    let check = blocked.blocked().expect("blocked").clone();
    assert!(!check.can_start);
    assert_eq!(check.reason, StartReason::PrerequisitesMissing);
    assert_eq!(check.missing.len(), 1);
    assert_eq!(check.missing[0].node_id, ids[0]);
    assert_eq!(check.missing[0].kind, MissingKind::NotCompleted);

    // Blocked calls write nothing.
    assert!(matches!(
        progress.lesson_progress(student(), ids[1]).await,
        Err(ProgressServiceError::ProgressNotFound { .. })
    ));
    let blocked_submit = progress
        .submit_element(student(), ids[1], el(4, 1), ElementAnswer::choice("b"))
        .await
        .unwrap();
    assert!(!blocked_submit.is_granted());

    let outcome = progress
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("b"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert!(outcome.lesson_completed);
    assert_eq!(outcome.lesson.status, ProgressStatus::Completed);
    assert_eq!(outcome.unlocked_nodes.len(), 1);
    assert_eq!(outcome.unlocked_nodes[0].id, ids[1]);
    assert_eq!(outcome.unlocked_nodes[0].unlocked_at, Some(fixed_now()));

    let started = progress.start_lesson(student(), ids[1]).await.unwrap();
    let started = started.granted().unwrap();
    assert_eq!(started.status, ProgressStatus::InProgress);
    assert_eq!(started.total_elements, 1);
}

#[tokio::test]
async fn propagation_is_idempotent() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[1, 4], &[(0, 1, 0)]).await;
    app.progress()
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("b"))
        .await
        .unwrap();
    assert!(is_unlocked(&app, &graph, ids[1]).await);

    let again = app
        .unlock_engine()
        .on_lesson_completed(student(), ids[0])
        .await
        .unwrap();
    assert!(again.is_empty());

    // Resubmitting a completed quiz keeps it completed and unlocks nothing new.
    let resubmit = app
        .progress()
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("a"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert!(!resubmit.lesson_completed);
    assert!(resubmit.unlocked_nodes.is_empty());
    assert_eq!(resubmit.element.score, Some(10));
}

#[tokio::test]
async fn manual_grade_crossing_threshold_unlocks_dependent() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[2, 4], &[(0, 1, 80)]).await;
    let progress = app.progress();

    progress
        .submit_element(student(), ids[0], el(2, 1), ElementAnswer::text("proof sketch"))
        .await
        .unwrap();
    let read = progress
        .submit_element(student(), ids[0], el(2, 2), ElementAnswer::viewed())
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert!(read.lesson_completed);
    assert_eq!(read.lesson.total_score, 10);
    assert!(read.unlocked_nodes.is_empty());

    let check = app.prerequisites().can_start(student(), ids[1]).await.unwrap();
    assert!(!check.can_start);
    assert!(matches!(
        check.missing[0].kind,
        MissingKind::BelowThreshold { required_percent: 80, .. }
    ));

    // 15 / 20 = 75%: still short.
    let graded = progress
        .grade_element(student(), ids[0], el(2, 1), 5)
        .await
        .unwrap();
    assert!(graded.unlocked_nodes.is_empty());
    assert!(!is_unlocked(&app, &graph, ids[1]).await);

    // 16 / 20 = 80% exactly meets the threshold.
    let graded = progress
        .grade_element(student(), ids[0], el(2, 1), 6)
        .await
        .unwrap();
    assert!(!graded.lesson_completed);
    assert_eq!(graded.lesson.total_score, 16);
    assert_eq!(graded.unlocked_nodes.len(), 1);
    assert!(is_unlocked(&app, &graph, ids[1]).await);

    let err = progress
        .grade_element(student(), ids[0], el(2, 1), 11)
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressServiceError::Progress(_)));
}

#[tokio::test]
async fn grading_requires_a_submission() {
    let app = memory();
    let (_graph, ids) = build(&app, false, &[2], &[]).await;
    let err = app
        .progress()
        .grade_element(student(), ids[0], el(2, 1), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressServiceError::ProgressNotFound { .. }));

    let err = app
        .progress()
        .grade_element(student(), ids[0], el(9, 1), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressServiceError::ElementNotFound { .. }));
}

#[tokio::test]
async fn all_required_prerequisites_must_hold() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[1, 4, 3], &[(0, 2, 0), (1, 2, 0)]).await;
    let progress = app.progress();

    let first = progress
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("b"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert!(first.unlocked_nodes.is_empty());
    let check = app.prerequisites().can_start(student(), ids[2]).await.unwrap();
    assert_eq!(check.missing.len(), 1);
    assert_eq!(check.missing[0].node_id, ids[1]);

    let second = progress
        .submit_element(student(), ids[1], el(4, 1), ElementAnswer::choice("b"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(second.unlocked_nodes.len(), 1);
    assert_eq!(second.unlocked_nodes[0].id, ids[2]);
    assert!(is_unlocked(&app, &graph, ids[2]).await);
}

#[tokio::test]
async fn skippable_graph_grants_access_everywhere() {
    let app = memory();
    let (graph, ids) = build(&app, true, &[1, 4], &[(0, 1, 100)]).await;
    assert!(!is_unlocked(&app, &graph, ids[1]).await);

    let check = app.prerequisites().can_start(student(), ids[1]).await.unwrap();
    assert!(check.can_start);
    assert_eq!(check.reason, StartReason::SkipAllowed);

    let started = app.progress().start_lesson(student(), ids[1]).await.unwrap();
    assert!(started.is_granted());
    assert!(is_unlocked(&app, &graph, ids[1]).await);
}

#[tokio::test]
async fn wrong_choice_can_be_retried() {
    let app = memory();
    let (_graph, ids) = build(&app, false, &[1], &[]).await;
    let progress = app.progress();

    let started = progress
        .start_element(student(), ids[0], el(1, 1))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(started.status, ProgressStatus::InProgress);
    assert_eq!(started.attempts, 1);

    let wrong = progress
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("a"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(wrong.element.status, ProgressStatus::InProgress);
    assert_eq!(wrong.element.score, Some(0));
    assert!(!wrong.lesson_completed);
    assert_eq!(wrong.lesson.status, ProgressStatus::InProgress);

    let right = progress
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("b"))
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(right.element.status, ProgressStatus::Completed);
    assert_eq!(right.element.attempts, 1);
    assert!(right.lesson_completed);

    let rows = progress.element_progress(student(), ids[0]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].answer, Some(ElementAnswer::choice("b")));
}

#[tokio::test]
async fn explicit_completion_rules() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[5, 3, 1], &[(0, 2, 0)]).await;
    let progress = app.progress();

    let err = progress.complete_lesson(student(), ids[1]).await.unwrap_err();
    assert!(matches!(
        err,
        ProgressServiceError::LessonIncomplete { completed: 0, total: 2, .. }
    ));

    let done = progress
        .complete_lesson(student(), ids[0])
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(done.lesson_progress.status, ProgressStatus::Completed);
    assert_eq!(done.lesson_progress.completed_at, Some(fixed_now()));
    assert_eq!(done.unlocked_nodes.len(), 1);
    assert!(is_unlocked(&app, &graph, ids[2]).await);

    let err = progress
        .start_element(student(), ids[1], el(1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressServiceError::ElementNotFound { .. }));
}

#[tokio::test]
async fn concurrent_submissions_unlock_exactly_once() {
    let app = memory();
    let (graph, ids) = build(&app, false, &[3, 4], &[(0, 1, 0)]).await;
    let progress = app.progress();

    let (left, right) = tokio::join!(
        tokio::spawn({
            let progress = Arc::clone(&progress);
            let node = ids[0];
            async move {
                progress
                    .submit_element(student(), node, el(3, 1), ElementAnswer::choice("b"))
                    .await
            }
        }),
        tokio::spawn({
            let progress = Arc::clone(&progress);
            let node = ids[0];
            async move {
                progress
                    .submit_element(student(), node, el(3, 2), ElementAnswer::choice("b"))
                    .await
            }
        }),
    );
    let outcomes: Vec<_> = [left, right]
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().granted().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.lesson_completed).count(), 1);
    let unlocked: Vec<_> = outcomes.iter().flat_map(|o| o.unlocked_nodes.iter()).collect();
    assert_eq!(unlocked.len(), 1);
    assert_eq!(unlocked[0].id, ids[1]);

    let lesson = progress.lesson_progress(student(), ids[0]).await.unwrap();
    assert_eq!(lesson.completed_elements, 2);
    assert_eq!(lesson.total_score, 10);
    assert!(is_unlocked(&app, &graph, ids[1]).await);
}

/// Two service stacks over one database stand in for two processes: neither
/// shares the other's graph locks, so only the database orders their writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn separate_processes_on_one_database_keep_both_submissions() {
    let url = "sqlite:file:memdb_progress_two_processes?mode=memory&cache=shared";
    let first = AppServices::from_storage(
        &Storage::sqlite(url).await.expect("connect first"),
        Clock::fixed(fixed_now()),
    );
    let second = AppServices::from_storage(
        &Storage::sqlite(url).await.expect("connect second"),
        Clock::fixed(fixed_now()),
    );
    first.catalog().seed(catalog()).await.expect("seed");

    for round in 1..=5 {
        let graph = first
            .graphs()
            .create_graph(student(), SubjectId::new(round), false)
            .await
            .expect("graph");
        let sets = first.graphs().add_node(graph.id, LessonId::new(3)).await.unwrap().id;
        let functions = first.graphs().add_node(graph.id, LessonId::new(4)).await.unwrap().id;
        first
            .graphs()
            .add_dependency(graph.id, sets, functions, DependencyType::Required, 0)
            .await
            .unwrap();
        first.unlock_engine().initialize_graph(graph.id).await.unwrap();

        let (left, right) = tokio::join!(
            tokio::spawn({
                let progress = first.progress();
                async move {
                    progress
                        .submit_element(student(), sets, el(3, 1), ElementAnswer::choice("b"))
                        .await
                }
            }),
            tokio::spawn({
                let progress = second.progress();
                async move {
                    progress
                        .submit_element(student(), sets, el(3, 2), ElementAnswer::choice("b"))
                        .await
                }
            }),
        );
        for joined in [left, right] {
            assert!(joined.unwrap().unwrap().is_granted());
        }

        let lesson = second.progress().lesson_progress(student(), sets).await.unwrap();
        assert_eq!(lesson.status, ProgressStatus::Completed, "round {round}");
        assert_eq!(lesson.completed_elements, 2, "round {round}");
        assert_eq!(lesson.total_score, 10, "round {round}");
        assert!(is_unlocked(&first, &graph, functions).await, "round {round}");
    }
}

/// Persistence that reads through to a real store but refuses every commit.
#[derive(Clone)]
struct RejectingPersistence(InMemoryRepository);

struct RejectingTransaction(Box<dyn GraphTransaction>);

fn disk_full() -> StorageError {
    StorageError::Connection("disk full".to_string())
}

#[async_trait]
impl ProgressPersistence for RejectingPersistence {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError> {
        Ok(Box::new(RejectingTransaction(self.0.begin().await?)))
    }
}

#[async_trait]
impl GraphTransaction for RejectingTransaction {
    async fn get_graph(&mut self, id: GraphId) -> Result<Option<Graph>, StorageError> {
        self.0.get_graph(id).await
    }

    async fn get_node(&mut self, id: NodeId) -> Result<Option<GraphNode>, StorageError> {
        self.0.get_node(id).await
    }

    async fn list_nodes(&mut self, graph_id: GraphId) -> Result<Vec<GraphNode>, StorageError> {
        self.0.list_nodes(graph_id).await
    }

    async fn list_edges(&mut self, graph_id: GraphId) -> Result<Vec<Dependency>, StorageError> {
        self.0.list_edges(graph_id).await
    }

    async fn list_element_progress(
        &mut self,
        student_id: StudentId,
        node_id: NodeId,
    ) -> Result<Vec<ElementProgress>, StorageError> {
        self.0.list_element_progress(student_id, node_id).await
    }

    async fn list_lesson_progress(
        &mut self,
        student_id: StudentId,
        graph_id: GraphId,
    ) -> Result<Vec<LessonProgress>, StorageError> {
        self.0.list_lesson_progress(student_id, graph_id).await
    }

    async fn students_in_graph(&mut self, graph_id: GraphId) -> Result<Vec<StudentId>, StorageError> {
        self.0.students_in_graph(graph_id).await
    }

    async fn students_on_node(&mut self, node_id: NodeId) -> Result<Vec<StudentId>, StorageError> {
        self.0.students_on_node(node_id).await
    }

    async fn insert_edge(self: Box<Self>, _edge: NewEdgeRecord) -> Result<Dependency, StorageError> {
        Err(disk_full())
    }

    async fn apply_progress(self: Box<Self>, _changes: &ProgressChanges) -> Result<(), StorageError> {
        Err(disk_full())
    }

    async fn apply_edge_removal(self: Box<Self>, _removal: &EdgeRemoval) -> Result<(), StorageError> {
        Err(disk_full())
    }

    async fn apply_node_removal(
        self: Box<Self>,
        _removal: &NodeRemoval,
    ) -> Result<RemovalCounts, StorageError> {
        Err(disk_full())
    }
}

#[tokio::test]
async fn failed_commit_leaves_no_partial_progress() {
    let repo = InMemoryRepository::new();
    let healthy = AppServices::from_storage(
        &Storage::from_repository(repo.clone()),
        Clock::fixed(fixed_now()),
    );
    let (graph, ids) = build(&healthy, false, &[1, 4], &[(0, 1, 0)]).await;

    let mut broken = Storage::from_repository(repo.clone());
    broken.persistence = Arc::new(RejectingPersistence(repo.clone()));
    let app = AppServices::from_storage(&broken, Clock::fixed(fixed_now()));

    let err = app
        .progress()
        .submit_element(student(), ids[0], el(1, 1), ElementAnswer::choice("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressServiceError::Storage(StorageError::Connection(_))));

    assert!(repo.list_element_progress(student(), ids[0]).await.unwrap().is_empty());
    assert!(repo.get_lesson_progress(student(), ids[0]).await.unwrap().is_none());
    assert!(!is_unlocked(&healthy, &graph, ids[1]).await);
}

#[tokio::test]
async fn unknown_nodes_are_reported() {
    let app = memory();
    build(&app, false, &[1], &[]).await;
    let missing = NodeId::new(999);
    assert!(matches!(
        app.progress().start_lesson(student(), missing).await,
        Err(ProgressServiceError::NodeNotFound(_))
    ));
    assert!(matches!(
        app.prerequisites().can_start(student(), missing).await,
        Err(ProgressServiceError::NodeNotFound(_))
    ));
    assert!(matches!(
        app.progress().element_progress(student(), missing).await,
        Err(ProgressServiceError::NodeNotFound(_))
    ));
}
