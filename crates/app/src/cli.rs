use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use pathway_core::model::{
    DependencyType, EdgeId, ElementAnswer, ElementId, GraphId, LessonId, NodeId, StudentId,
    SubjectId,
};

pub const DEFAULT_DB_URL: &str = "sqlite://pathway.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "pathway=info,services=info,storage=info";

#[derive(Debug, Parser)]
#[command(name = "pathway")]
#[command(version, about = "Lesson prerequisite graphs with score-gated unlocking", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database URL or path
    #[arg(long, global = true, env = "PATHWAY_DB_URL", default_value = DEFAULT_DB_URL)]
    pub db: String,

    /// Log filter directives, e.g. `services=debug`
    #[arg(long, global = true, env = "PATHWAY_LOG")]
    pub log: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the database schema
    Migrate,

    /// Upsert lessons from a JSON file holding an array of lessons
    SeedLessons { path: PathBuf },

    /// Create the graph for a student and subject
    CreateGraph {
        #[arg(long)]
        student: StudentId,
        #[arg(long)]
        subject: SubjectId,
        /// Let the student start any lesson regardless of prerequisites
        #[arg(long)]
        allow_skip: bool,
    },

    /// Place a catalog lesson in a graph
    AddNode {
        #[arg(long)]
        graph: GraphId,
        #[arg(long)]
        lesson: LessonId,
    },

    /// Add a prerequisite edge FROM -> TO
    AddEdge {
        #[arg(long)]
        graph: GraphId,
        #[arg(long)]
        from: NodeId,
        #[arg(long)]
        to: NodeId,
        /// Advisory edge that never gates access
        #[arg(long)]
        optional: bool,
        /// Minimum score percent required on FROM (0-100)
        #[arg(long, default_value_t = 0)]
        min_score: u8,
    },

    /// Remove an edge and unlock its target if now startable
    RemoveEdge { edge: EdgeId },

    /// Remove a node and recalculate lock state
    RemoveNode { node: NodeId },

    /// Unlock every node without required prerequisites
    InitGraph { graph: GraphId },

    /// Check whether a student may start a lesson
    CanStart(StudentNode),

    /// Start a lesson
    StartLesson(StudentNode),

    /// Submit an answer for one element
    Submit {
        #[command(flatten)]
        target: StudentNode,
        #[arg(long)]
        element: ElementId,
        #[command(flatten)]
        answer: AnswerArgs,
    },

    /// Grade a submitted problem by hand
    Grade {
        #[command(flatten)]
        target: StudentNode,
        #[arg(long)]
        element: ElementId,
        #[arg(long)]
        score: u32,
    },

    /// Complete a lesson explicitly
    Complete(StudentNode),

    /// Print a graph, optionally with a student's progress per node
    Show {
        graph: GraphId,
        #[arg(long)]
        student: Option<StudentId>,
    },
}

#[derive(Debug, Clone, Copy, Args)]
pub struct StudentNode {
    #[arg(long)]
    pub student: StudentId,
    #[arg(long)]
    pub node: NodeId,
}

#[derive(Debug, Clone, Default, Args)]
pub struct AnswerArgs {
    /// Chosen option for single-choice elements
    #[arg(long)]
    pub choice: Option<String>,
    /// Free-form answer for problems
    #[arg(long)]
    pub text: Option<String>,
    /// Mark reading material as viewed
    #[arg(long)]
    pub viewed: bool,
    /// Watched fraction of a video (0.0-1.0)
    #[arg(long)]
    pub watched: Option<f64>,
}

impl From<AnswerArgs> for ElementAnswer {
    fn from(args: AnswerArgs) -> Self {
        ElementAnswer {
            text: args.text,
            choice: args.choice,
            viewed: args.viewed,
            watched_fraction: args.watched,
        }
    }
}

pub fn dependency_type(optional: bool) -> DependencyType {
    if optional {
        DependencyType::Optional
    } else {
        DependencyType::Required
    }
}
