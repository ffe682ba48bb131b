//! Prerequisite evaluation for one node and one student.
//!
//! Read-only: the same inputs always produce the same answer, so the check is
//! shared by the student-facing "can I start" query and by the unlock
//! planners.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{EdgeId, GraphSnapshot, LessonId, LessonProgress, NodeId, ProgressStatus};

/// Access to a student's lesson progress keyed by node.
pub trait ProgressLookup {
    fn lesson_progress(&self, node: NodeId) -> Option<&LessonProgress>;
}

impl ProgressLookup for BTreeMap<NodeId, LessonProgress> {
    fn lesson_progress(&self, node: NodeId) -> Option<&LessonProgress> {
        self.get(&node)
    }
}

/// Why a prerequisite is not satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissingKind {
    NotCompleted,
    BelowThreshold { score_percent: f64, required_percent: u8 },
}

/// One unsatisfied required edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingPrerequisite {
    pub dependency_id: EdgeId,
    pub node_id: NodeId,
    pub lesson_id: LessonId,
    /// Current status of the prerequisite for this student.
    pub status: ProgressStatus,
    #[serde(flatten)]
    pub kind: MissingKind,
}

impl fmt::Display for MissingPrerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MissingKind::NotCompleted => write!(
                f,
                "lesson {} (node {}) is {}",
                self.lesson_id, self.node_id, self.status
            ),
            MissingKind::BelowThreshold {
                score_percent,
                required_percent,
            } => write!(
                f,
                "lesson {} (node {}) scored {score_percent:.1}%, {required_percent}% required",
                self.lesson_id, self.node_id
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    /// The graph allows skipping prerequisites.
    SkipAllowed,
    /// The node has no required incoming edges.
    NoPrerequisites,
    /// Every required prerequisite is satisfied.
    PrerequisitesMet,
    /// At least one required prerequisite is missing.
    PrerequisitesMissing,
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartReason::SkipAllowed => "prerequisites are skippable in this graph",
            StartReason::NoPrerequisites => "lesson has no required prerequisites",
            StartReason::PrerequisitesMet => "all prerequisites are satisfied",
            StartReason::PrerequisitesMissing => "some prerequisites are not satisfied",
        })
    }
}

/// Result of `check_prerequisites`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrerequisiteCheck {
    pub node_id: NodeId,
    pub can_start: bool,
    pub reason: StartReason,
    pub missing: Vec<MissingPrerequisite>,
}

impl PrerequisiteCheck {
    fn granted(node_id: NodeId, reason: StartReason) -> Self {
        Self {
            node_id,
            can_start: true,
            reason,
            missing: Vec::new(),
        }
    }
}

/// Evaluate whether a student may start `node`.
///
/// Optional edges are advisory and never consulted. A node outside the snapshot
/// has no incoming edges and is therefore startable; callers resolve membership
/// before asking.
#[must_use]
pub fn check_prerequisites(
    snapshot: &GraphSnapshot,
    node: NodeId,
    progress: &impl ProgressLookup,
) -> PrerequisiteCheck {
    if snapshot.allow_skip() {
        return PrerequisiteCheck::granted(node, StartReason::SkipAllowed);
    }

    let mut required = snapshot.required_incoming(node).peekable();
    if required.peek().is_none() {
        return PrerequisiteCheck::granted(node, StartReason::NoPrerequisites);
    }

    let mut missing = Vec::new();
    for edge in required {
        let lesson_id = snapshot
            .node(edge.from_node)
            .map_or(LessonId::new(0), |n| n.lesson_id);
        let prior = progress.lesson_progress(edge.from_node);

        let kind = match prior {
            Some(p) if p.is_completed() => {
                if p.meets(edge.min_score) {
                    continue;
                }
                MissingKind::BelowThreshold {
                    score_percent: p.score_percent(),
                    required_percent: edge.min_score.percent(),
                }
            }
            _ => MissingKind::NotCompleted,
        };

        missing.push(MissingPrerequisite {
            dependency_id: edge.id,
            node_id: edge.from_node,
            lesson_id,
            status: prior.map_or(ProgressStatus::NotStarted, |p| p.status),
            kind,
        });
    }

    let can_start = missing.is_empty();
    PrerequisiteCheck {
        node_id: node,
        can_start,
        reason: if can_start {
            StartReason::PrerequisitesMet
        } else {
            StartReason::PrerequisitesMissing
        },
        missing,
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{
        Dependency, DependencyType, Graph, GraphId, GraphNode, MinScore, StudentId, SubjectId,
    };
    use crate::time::fixed_now;

    pub(crate) fn snapshot(
        allow_skip: bool,
        nodes: &[u64],
        edges: &[(u64, u64, DependencyType, u8)],
    ) -> GraphSnapshot {
        let graph = Graph {
            id: GraphId::new(1),
            student_id: StudentId::new(1),
            subject_id: SubjectId::new(1),
            allow_skip,
            created_at: fixed_now(),
        };
        let nodes = nodes
            .iter()
            .map(|&id| GraphNode {
                id: NodeId::new(id),
                graph_id: graph.id,
                lesson_id: LessonId::new(id * 10),
                is_unlocked: false,
                unlocked_at: None,
                created_at: fixed_now(),
            })
            .collect();
        let edges = edges
            .iter()
            .enumerate()
            .map(|(i, &(from, to, kind, min))| Dependency {
                id: EdgeId::new(i as u64 + 1),
                graph_id: graph.id,
                from_node: NodeId::new(from),
                to_node: NodeId::new(to),
                dependency_type: kind,
                min_score: MinScore::new(min).unwrap(),
                created_at: fixed_now(),
            })
            .collect();
        GraphSnapshot::new(graph, nodes, edges).unwrap()
    }

    pub(crate) fn completed(node: u64, score: u32, max: u32) -> LessonProgress {
        let mut lp = LessonProgress::new(StudentId::new(1), NodeId::new(node));
        lp.total_score = score;
        lp.max_possible_score = max;
        lp.mark_completed(fixed_now());
        lp
    }

    fn progress(entries: Vec<LessonProgress>) -> BTreeMap<NodeId, LessonProgress> {
        entries.into_iter().map(|p| (p.node_id, p)).collect()
    }

    #[test]
    fn root_node_can_start() {
        let s = snapshot(false, &[1, 2], &[(1, 2, DependencyType::Required, 0)]);
        let check = check_prerequisites(&s, NodeId::new(1), &progress(vec![]));
        assert!(check.can_start);
        assert_eq!(check.reason, StartReason::NoPrerequisites);
    }

    #[test]
    fn optional_edges_never_block() {
        let s = snapshot(false, &[1, 2], &[(1, 2, DependencyType::Optional, 90)]);
        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![]));
        assert!(check.can_start);
        assert_eq!(check.reason, StartReason::NoPrerequisites);
    }

    #[test]
    fn missing_progress_is_reported_as_not_started() {
        let s = snapshot(false, &[1, 2], &[(1, 2, DependencyType::Required, 0)]);
        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![]));
        assert!(!check.can_start);
        assert_eq!(check.missing.len(), 1);
        assert_eq!(check.missing[0].node_id, NodeId::new(1));
        assert_eq!(check.missing[0].lesson_id, LessonId::new(10));
        assert_eq!(check.missing[0].status, ProgressStatus::NotStarted);
        assert_eq!(check.missing[0].kind, MissingKind::NotCompleted);
    }

    #[test]
    fn in_progress_prerequisite_reports_its_status() {
        let s = snapshot(false, &[1, 2], &[(1, 2, DependencyType::Required, 0)]);
        let mut lp = LessonProgress::new(StudentId::new(1), NodeId::new(1));
        lp.start(fixed_now());
        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![lp]));
        assert_eq!(check.missing[0].status, ProgressStatus::InProgress);
    }

    #[test]
    fn threshold_gate_reports_score_gap() {
        let s = snapshot(false, &[1, 2], &[(1, 2, DependencyType::Required, 80)]);
        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![completed(1, 75, 100)]));
        assert!(!check.can_start);
        assert_eq!(
            check.missing[0].kind,
            MissingKind::BelowThreshold {
                score_percent: 75.0,
                required_percent: 80
            }
        );
        assert!(check.missing[0].to_string().contains("80% required"));

        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![completed(1, 80, 100)]));
        assert!(check.can_start);
        assert_eq!(check.reason, StartReason::PrerequisitesMet);
    }

    #[test]
    fn every_required_prerequisite_is_checked() {
        let s = snapshot(
            false,
            &[1, 2, 3],
            &[
                (1, 3, DependencyType::Required, 0),
                (2, 3, DependencyType::Required, 0),
            ],
        );
        let only_a = progress(vec![completed(1, 0, 0)]);
        let check = check_prerequisites(&s, NodeId::new(3), &only_a);
        assert!(!check.can_start);
        assert_eq!(check.missing.len(), 1);
        assert_eq!(check.missing[0].node_id, NodeId::new(2));

        let both = progress(vec![completed(1, 0, 0), completed(2, 0, 0)]);
        assert!(check_prerequisites(&s, NodeId::new(3), &both).can_start);
    }

    #[test]
    fn allow_skip_bypasses_everything() {
        let s = snapshot(true, &[1, 2], &[(1, 2, DependencyType::Required, 100)]);
        let check = check_prerequisites(&s, NodeId::new(2), &progress(vec![]));
        assert!(check.can_start);
        assert_eq!(check.reason, StartReason::SkipAllowed);
    }
}
