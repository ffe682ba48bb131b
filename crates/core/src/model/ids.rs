use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for parsing an id from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    kind: &'static str,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {} from string", self.kind)
    }
}

impl std::error::Error for ParseIdError {}

// Every id is an opaque u64 assigned either by storage (graphs, nodes, edges)
// or by the collaborator that owns the entity (students, subjects, lessons).
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the underlying u64 value
            #[must_use]
            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self::new).map_err(|_| ParseIdError {
                    kind: stringify!($name),
                })
            }
        }
    };
}

define_id!(
    /// Identifies a student; supplied by the identity collaborator.
    StudentId
);
define_id!(
    /// Identifies a subject; a student has at most one graph per subject.
    SubjectId
);
define_id!(
    /// Identifies one (student, subject) dependency graph.
    GraphId
);
define_id!(
    /// Identifies a lesson placed inside a graph.
    NodeId
);
define_id!(
    /// Identifies a prerequisite edge.
    EdgeId
);
define_id!(
    /// Identifies a lesson definition in the catalog.
    LessonId
);
define_id!(
    /// Identifies a single element (problem, question, text, video) of a lesson.
    ElementId
);

// ─── Tests ─────────────────────────────────────────────────────────────────────
