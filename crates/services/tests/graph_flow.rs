use pathway_core::model::{
    DependencyType, ElementAnswer, ElementId, ElementKind, Graph, GraphError, GraphNode, Lesson,
    LessonElement, LessonId, NodeId, StudentId, SubjectId,
};
use pathway_core::time::fixed_now;
use services::{AppServices, Clock, GraphServiceError};
use storage::repository::Storage;

fn student() -> StudentId {
    StudentId::new(7)
}

/// One required single-choice element, id `lesson * 100 + 1`, correct answer "b".
fn quiz_lesson(id: u64) -> Lesson {
    Lesson::new(
        LessonId::new(id),
        format!("lesson {id}"),
        vec![LessonElement {
            id: ElementId::new(id * 100 + 1),
            lesson_id: LessonId::new(id),
            position: 0,
            title: "check".to_string(),
            kind: ElementKind::SingleChoice {
                correct_choice: "b".to_string(),
            },
            max_score: 10,
            is_required: true,
        }],
    )
    .expect("valid lesson")
}

fn quiz_element(lesson: u64) -> ElementId {
    ElementId::new(lesson * 100 + 1)
}

/// Services with lessons 1..=n seeded and an empty graph for `student()`.
async fn setup(app: AppServices, lessons: u64, allow_skip: bool) -> (AppServices, Graph) {
    app.catalog()
        .seed((1..=lessons).map(quiz_lesson).collect())
        .await
        .expect("seed lessons");
    let graph = app
        .graphs()
        .create_graph(student(), SubjectId::new(1), allow_skip)
        .await
        .expect("create graph");
    (app, graph)
}

async fn add_nodes(app: &AppServices, graph: &Graph, lessons: &[u64]) -> Vec<NodeId> {
    let mut ids = Vec::new();
    for &lesson in lessons {
        let node = app
            .graphs()
            .add_node(graph.id, LessonId::new(lesson))
            .await
            .expect("add node");
        ids.push(node.id);
    }
    ids
}

async fn node(app: &AppServices, graph: &Graph, id: NodeId) -> GraphNode {
    app.graphs()
        .snapshot(graph.id)
        .await
        .expect("snapshot")
        .node(id)
        .cloned()
        .expect("node present")
}

async fn pass_quiz(app: &AppServices, node: NodeId, lesson: u64) -> Vec<GraphNode> {
    app.progress()
        .submit_element(student(), node, quiz_element(lesson), ElementAnswer::choice("b"))
        .await
        .expect("submit")
        .granted()
        .expect("node accessible")
        .unlocked_nodes
}

fn memory() -> AppServices {
    AppServices::in_memory(Clock::fixed(fixed_now()))
}

#[tokio::test]
async fn reverse_edge_is_rejected_as_cycle() {
    let (app, graph) = setup(memory(), 3, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    let graphs = app.graphs();

    graphs
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 0)
        .await
        .expect("a -> b");
    graphs
        .add_dependency(graph.id, ids[1], ids[2], DependencyType::Optional, 0)
        .await
        .expect("b -> c");

    let direct = graphs
        .add_dependency(graph.id, ids[1], ids[0], DependencyType::Required, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        direct,
        GraphServiceError::Graph(GraphError::CycleDetected { .. })
    ));

    // Optional edges take part in cycle detection too.
    let transitive = graphs
        .add_dependency(graph.id, ids[2], ids[0], DependencyType::Optional, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        transitive,
        GraphServiceError::Graph(GraphError::CycleDetected { .. })
    ));

    assert_eq!(graphs.list_edges(graph.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn structural_violations_are_reported_in_order() {
    let (app, graph) = setup(memory(), 2, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2]).await;
    let graphs = app.graphs();

    let err = graphs
        .add_dependency(graph.id, ids[0], ids[0], DependencyType::Required, 101)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphServiceError::Graph(GraphError::InvalidMinScore(101))));

    let err = graphs
        .add_dependency(graph.id, ids[0], ids[0], DependencyType::Required, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphServiceError::Graph(GraphError::SelfDependency(_))));

    let other = graphs
        .create_graph(student(), SubjectId::new(2), false)
        .await
        .unwrap();
    let foreign = graphs.add_node(other.id, LessonId::new(1)).await.unwrap();
    let err = graphs
        .add_dependency(graph.id, ids[0], foreign.id, DependencyType::Required, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GraphServiceError::Graph(GraphError::EdgeCrossGraph { node, .. }) if node == foreign.id
    ));

    graphs
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 50)
        .await
        .unwrap();
    let err = graphs
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Optional, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphServiceError::Graph(GraphError::DuplicateEdge { .. })));
}

#[tokio::test]
async fn graphs_and_nodes_are_unique() {
    let (app, graph) = setup(memory(), 1, false).await;
    let graphs = app.graphs();

    let err = graphs
        .create_graph(student(), SubjectId::new(1), true)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphServiceError::GraphAlreadyExists { .. }));

    graphs.add_node(graph.id, LessonId::new(1)).await.unwrap();
    let err = graphs.add_node(graph.id, LessonId::new(1)).await.unwrap_err();
    assert!(matches!(err, GraphServiceError::LessonAlreadyInGraph { .. }));

    let err = graphs.add_node(graph.id, LessonId::new(99)).await.unwrap_err();
    assert!(matches!(err, GraphServiceError::LessonNotFound(_)));
}

#[tokio::test]
async fn initialization_unlocks_roots_and_is_repeatable() {
    let (app, graph) = setup(memory(), 3, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    app.graphs()
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 0)
        .await
        .unwrap();
    app.graphs()
        .add_dependency(graph.id, ids[0], ids[2], DependencyType::Optional, 0)
        .await
        .unwrap();

    let unlocked = app.unlock_engine().initialize_graph(graph.id).await.unwrap();
    let mut unlocked_ids: Vec<_> = unlocked.iter().map(|n| n.id).collect();
    unlocked_ids.sort();
    assert_eq!(unlocked_ids, vec![ids[0], ids[2]]);
    assert!(unlocked.iter().all(|n| n.unlocked_at == Some(fixed_now())));

    assert!(app.unlock_engine().initialize_graph(graph.id).await.unwrap().is_empty());
    assert!(!node(&app, &graph, ids[1]).await.is_unlocked);
}

#[tokio::test]
async fn removing_a_dependency_unlocks_but_never_relocks() {
    let (app, graph) = setup(memory(), 3, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    let graphs = app.graphs();
    let ab = graphs
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 0)
        .await
        .unwrap();
    let cb = graphs
        .add_dependency(graph.id, ids[2], ids[1], DependencyType::Required, 0)
        .await
        .unwrap();
    app.unlock_engine().initialize_graph(graph.id).await.unwrap();

    // B still needs C after A -> B goes away.
    assert!(graphs.remove_dependency(ab.id).await.unwrap().is_empty());
    assert!(!node(&app, &graph, ids[1]).await.is_unlocked);

    let unlocked = graphs.remove_dependency(cb.id).await.unwrap();
    assert_eq!(unlocked.len(), 1);
    assert_eq!(unlocked[0].id, ids[1]);
    assert!(unlocked[0].is_unlocked);

    let err = graphs.remove_dependency(cb.id).await.unwrap_err();
    assert!(matches!(err, GraphServiceError::EdgeNotFound(_)));
}

#[tokio::test]
async fn node_deletion_purges_progress_and_relocks_orphans() {
    let (app, graph) = setup(memory(), 4, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3, 4]).await;
    let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
    let graphs = app.graphs();
    for (from, to) in [(a, b), (b, c), (a, d), (d, c)] {
        graphs
            .add_dependency(graph.id, from, to, DependencyType::Required, 0)
            .await
            .unwrap();
    }
    app.unlock_engine().initialize_graph(graph.id).await.unwrap();

    assert_eq!(pass_quiz(&app, a, 1).await.len(), 2);
    assert!(pass_quiz(&app, b, 2).await.is_empty());
    let unlocked = pass_quiz(&app, d, 4).await;
    assert_eq!(unlocked.iter().map(|n| n.id).collect::<Vec<_>>(), vec![c]);

    let report = graphs.remove_node(b).await.unwrap();
    assert!(report.node_removed);
    assert_eq!(report.edges_removed, 2);
    assert_eq!(report.deleted_lesson_progress, 1);
    assert_eq!(report.deleted_element_progress, 1);
    assert_eq!(report.recalculated_students, 1);
    assert_eq!(report.relocked_nodes, vec![c]);
    assert!(report.unlocked_nodes.is_empty());

    let snapshot = graphs.snapshot(graph.id).await.unwrap();
    assert!(!snapshot.contains(b));
    assert!(snapshot.edges().iter().all(|e| !e.touches(b)));
    assert!(!snapshot.node(c).unwrap().is_unlocked);
    assert!(snapshot.node(d).unwrap().is_unlocked);

    // D still gates C and is completed, so access unlocks it again.
    let started = app.progress().start_lesson(student(), c).await.unwrap();
    assert!(started.is_granted());
    assert!(node(&app, &graph, c).await.is_unlocked);

    let err = graphs.remove_node(b).await.unwrap_err();
    assert!(matches!(err, GraphServiceError::NodeNotFound(_)));
}

#[tokio::test]
async fn deleting_the_only_prerequisite_leaves_a_root() {
    let (app, graph) = setup(memory(), 2, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2]).await;
    let (a, c) = (ids[0], ids[1]);
    app.graphs()
        .add_dependency(graph.id, a, c, DependencyType::Required, 0)
        .await
        .unwrap();
    app.unlock_engine().initialize_graph(graph.id).await.unwrap();
    assert_eq!(pass_quiz(&app, a, 1).await.len(), 1);

    let report = app.graphs().remove_node(a).await.unwrap();
    assert!(report.relocked_nodes.is_empty());
    assert!(report.unlocked_nodes.is_empty());
    assert!(node(&app, &graph, c).await.is_unlocked);

    // Recalculation already matches what initialization would produce.
    assert!(app.unlock_engine().initialize_graph(graph.id).await.unwrap().is_empty());
    let check = app.prerequisites().can_start(student(), c).await.unwrap();
    assert!(check.can_start);
}

#[tokio::test]
async fn deleting_one_of_two_completed_prerequisites_relocks_dependent() {
    let (app, graph) = setup(memory(), 3, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let graphs = app.graphs();
    for from in [a, b] {
        graphs
            .add_dependency(graph.id, from, c, DependencyType::Required, 0)
            .await
            .unwrap();
    }
    app.unlock_engine().initialize_graph(graph.id).await.unwrap();
    assert!(pass_quiz(&app, a, 1).await.is_empty());
    assert_eq!(pass_quiz(&app, b, 2).await.len(), 1);
    assert!(node(&app, &graph, c).await.is_unlocked);

    let report = graphs.remove_node(a).await.unwrap();
    assert_eq!(report.relocked_nodes, vec![c]);
    assert_eq!(report.deleted_lesson_progress, 1);
    let relocked = node(&app, &graph, c).await;
    assert!(!relocked.is_unlocked);
    assert_eq!(relocked.unlocked_at, None);

    // Progress on the surviving prerequisite is untouched.
    let kept = app.progress().lesson_progress(student(), b).await.unwrap();
    assert!(kept.is_completed());
    assert_eq!(app.progress().element_progress(student(), b).await.unwrap().len(), 1);
}

#[tokio::test]
async fn orphan_with_other_prerequisites_stays_locked_until_accessed() {
    let (app, graph) = setup(memory(), 3, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let graphs = app.graphs();
    graphs
        .add_dependency(graph.id, a, c, DependencyType::Required, 0)
        .await
        .unwrap();
    graphs
        .add_dependency(graph.id, b, c, DependencyType::Required, 0)
        .await
        .unwrap();
    app.unlock_engine().initialize_graph(graph.id).await.unwrap();
    assert!(pass_quiz(&app, a, 1).await.is_empty());

    let report = graphs.remove_node(b).await.unwrap();
    assert!(report.unlocked_nodes.is_empty());
    assert!(report.relocked_nodes.is_empty());
    assert!(!node(&app, &graph, c).await.is_unlocked);

    // A alone now gates C and is completed.
    let check = app.prerequisites().can_start(student(), c).await.unwrap();
    assert!(check.can_start);
    let started = app.progress().start_lesson(student(), c).await.unwrap();
    assert!(started.is_granted());
    assert!(node(&app, &graph, c).await.is_unlocked);
}

#[tokio::test]
async fn deletion_in_skippable_graph_unlocks_every_remaining_node() {
    let (app, graph) = setup(memory(), 3, true).await;
    let ids = add_nodes(&app, &graph, &[1, 2, 3]).await;
    let graphs = app.graphs();
    graphs
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 0)
        .await
        .unwrap();
    graphs
        .add_dependency(graph.id, ids[1], ids[2], DependencyType::Required, 90)
        .await
        .unwrap();

    let report = graphs.remove_node(ids[0]).await.unwrap();
    assert_eq!(report.unlocked_nodes, vec![ids[1], ids[2]]);
    assert!(report.relocked_nodes.is_empty());
    assert_eq!(report.edges_removed, 1);
    assert_eq!(report.deleted_lesson_progress, 0);
}

#[tokio::test]
async fn sqlite_backed_graph_flow() {
    let storage = Storage::sqlite("sqlite:file:memdb_services_graph_flow?mode=memory&cache=shared")
        .await
        .expect("connect sqlite");
    let app = AppServices::from_storage(&storage, Clock::fixed(fixed_now()));
    let (app, graph) = setup(app, 2, false).await;
    let ids = add_nodes(&app, &graph, &[1, 2]).await;
    app.graphs()
        .add_dependency(graph.id, ids[0], ids[1], DependencyType::Required, 60)
        .await
        .unwrap();
    let err = app
        .graphs()
        .add_dependency(graph.id, ids[1], ids[0], DependencyType::Required, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphServiceError::Graph(GraphError::CycleDetected { .. })));

    app.unlock_engine().initialize_graph(graph.id).await.unwrap();
    let unlocked = pass_quiz(&app, ids[0], 1).await;
    assert_eq!(unlocked.len(), 1);
    assert_eq!(unlocked[0].id, ids[1]);
    assert!(node(&app, &graph, ids[1]).await.is_unlocked);

    let report = app.graphs().remove_node(ids[0]).await.unwrap();
    assert_eq!(report.deleted_lesson_progress, 1);
    assert_eq!(report.edges_removed, 1);
    assert!(report.relocked_nodes.is_empty());
    assert!(node(&app, &graph, ids[1]).await.is_unlocked);
}
