//! Plan data model, validation, and durable storage.
//!
//! A [`Plan`] is the JSON document produced by the planner. Subtasks keep
//! their declaration order; execution order is decided by
//! `parallel_group` alone.

pub mod store;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use store::{PersistenceError, PlanStore};
pub use validate::{
    LogicalWarning, MAX_FIELD_CHARS, StructuralError, ValidationPolicy, validate_logic,
    validate_structure,
};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a subtask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------
// Result references
// ---------------------------------------------------------------------------

/// Opaque handle to a subtask output held by the context store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// One unit of work inside a [`Plan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Identifier, unique within the plan and referenced by `depends_on`.
    pub id: String,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub notes: String,
    /// Agent that should handle the subtask.
    pub agent_key: String,
    /// Execution engine, e.g. `local`, `cloud`, `tool-enabled`.
    pub engine: String,
    /// Phase number; subtasks sharing a group run concurrently.
    pub parallel_group: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Subtask {
    /// Create a pending subtask with empty notes and no dependencies.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        objective: impl Into<String>,
        agent_key: impl Into<String>,
        engine: impl Into<String>,
        parallel_group: u32,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            objective: objective.into(),
            notes: String::new(),
            agent_key: agent_key.into(),
            engine: engine.into(),
            parallel_group,
            depends_on: Vec::new(),
            status: SubtaskStatus::Pending,
            result_ref: None,
            error: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// One synthesis step of the merge phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStep {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// How subtask outputs should be combined into the final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub steps: Vec<MergeStep>,
}

/// A decomposed goal: subtasks, merge instructions, and free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub merge: MergeSpec,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Counts of subtasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanProgress {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Plan {
    pub fn new(subtasks: Vec<Subtask>) -> Self {
        Self {
            subtasks,
            merge: MergeSpec::default(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_merge(mut self, merge: MergeSpec) -> Self {
        self.merge = merge;
        self
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<SubtaskStatus> {
        self.subtask(id).map(|s| s.status)
    }

    /// Subtask ids keyed by parallel group, ascending. Ids within a group
    /// keep declaration order.
    pub fn groups(&self) -> BTreeMap<u32, Vec<String>> {
        let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for subtask in &self.subtasks {
            groups
                .entry(subtask.parallel_group)
                .or_default()
                .push(subtask.id.clone());
        }
        groups
    }

    pub fn progress(&self) -> PlanProgress {
        let mut progress = PlanProgress::default();
        for subtask in &self.subtasks {
            match subtask.status {
                SubtaskStatus::Pending => progress.pending += 1,
                SubtaskStatus::Running => progress.running += 1,
                SubtaskStatus::Completed => progress.completed += 1,
                SubtaskStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }

    /// `true` when every subtask has status `completed`.
    pub fn is_complete(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| s.status == SubtaskStatus::Completed)
    }
}
