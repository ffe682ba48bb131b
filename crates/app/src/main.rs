mod cli;
mod db;

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pathway_core::model::{Dependency, Graph, GraphNode, Lesson, LessonProgress, NodeId};
use services::{AppServices, Clock, ProgressServiceError};

use crate::cli::{Cli, Command, DEFAULT_LOG_FILTER, dependency_type};

/// Graph as printed by `show`.
#[derive(Debug, Serialize)]
struct GraphView {
    graph: Graph,
    nodes: Vec<GraphNode>,
    edges: Vec<Dependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<BTreeMap<NodeId, LessonProgress>>,
}

fn init_tracing(directive: Option<&str>) -> anyhow::Result<()> {
    let filter = match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid log filter: {directive}"))?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_url = db::normalize_sqlite_url(&cli.db);
    db::prepare_sqlite_file(&db_url)?;
    let app = AppServices::new_sqlite(&db_url, Clock::system())
        .await
        .with_context(|| format!("opening {db_url}"))?;

    match cli.command {
        Command::Migrate => {
            info!(db_url = %db_url, "schema up to date");
            print_json(&serde_json::json!({ "database": db_url, "migrated": true }))
        }
        Command::SeedLessons { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let lessons: Vec<Lesson> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing lessons from {}", path.display()))?;
            let saved = app.catalog().seed(lessons).await?;
            print_json(&serde_json::json!({ "lessons_saved": saved }))
        }
        Command::CreateGraph {
            student,
            subject,
            allow_skip,
        } => print_json(&app.graphs().create_graph(student, subject, allow_skip).await?),
        Command::AddNode { graph, lesson } => {
            print_json(&app.graphs().add_node(graph, lesson).await?)
        }
        Command::AddEdge {
            graph,
            from,
            to,
            optional,
            min_score,
        } => print_json(
            &app.graphs()
                .add_dependency(graph, from, to, dependency_type(optional), min_score)
                .await?,
        ),
        Command::RemoveEdge { edge } => print_json(&app.graphs().remove_dependency(edge).await?),
        Command::RemoveNode { node } => print_json(&app.graphs().remove_node(node).await?),
        Command::InitGraph { graph } => {
            print_json(&app.unlock_engine().initialize_graph(graph).await?)
        }
        Command::CanStart(target) => print_json(
            &app.prerequisites()
                .can_start(target.student, target.node)
                .await?,
        ),
        Command::StartLesson(target) => print_json(
            &app.progress()
                .start_lesson(target.student, target.node)
                .await?,
        ),
        Command::Submit {
            target,
            element,
            answer,
        } => print_json(
            &app.progress()
                .submit_element(target.student, target.node, element, answer.into())
                .await?,
        ),
        Command::Grade {
            target,
            element,
            score,
        } => print_json(
            &app.progress()
                .grade_element(target.student, target.node, element, score)
                .await?,
        ),
        Command::Complete(target) => print_json(
            &app.progress()
                .complete_lesson(target.student, target.node)
                .await?,
        ),
        Command::Show { graph, student } => {
            let graphs = app.graphs();
            let snapshot = graphs.snapshot(graph).await?;
            let progress = match student {
                Some(student) => {
                    let mut by_node = BTreeMap::new();
                    for node in snapshot.nodes() {
                        match app.progress().lesson_progress(student, node.id).await {
                            Ok(p) => {
                                by_node.insert(node.id, p);
                            }
                            Err(ProgressServiceError::ProgressNotFound { .. }) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Some(by_node)
                }
                None => None,
            };
            print_json(&GraphView {
                graph: snapshot.graph().clone(),
                nodes: snapshot.nodes().cloned().collect(),
                edges: snapshot.edges().to_vec(),
                progress,
            })
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log.as_deref()) {
        eprintln!("{err:#}");
        std::process::exit(2);
    }
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
