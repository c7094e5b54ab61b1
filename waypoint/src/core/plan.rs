//! Task and Plan data model.
//!
//! These types are the durable contract between the planner, the execution
//! loop, and the replanner. They carry no I/O; persistence lives in
//! [`crate::store`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Lifecycle status of a task.
///
/// `Pending -> InProgress -> {Completed, Failed, Skipped}`. Tasks are never
/// deleted; superseded tasks are marked `Skipped` with a reason so the audit
/// history stays intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// True for statuses the execution loop will never revisit on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// One observation recorded during task execution (tool result, oracle
/// failure, replan application). Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Short machine-readable kind (e.g. `tool_result`, `oracle_error`, `replan`).
    pub kind: String,
    /// Human-readable detail, normalized (never a raw stack trace).
    pub detail: String,
}

/// A unit of planned work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable ordinal, unique within a plan. Never reused, even for
    /// superseded tasks.
    pub position: u32,
    /// Human-readable goal for this task.
    pub description: String,
    /// Resolved capability name, if the planner already picked one.
    pub tool_name: Option<String>,
    /// Key -> value parameters for the tool call.
    #[serde(default)]
    pub parameters: Map<String, serde_json::Value>,
    /// Positions that must be `Completed` before this task is eligible.
    #[serde(default)]
    pub dependencies: BTreeSet<u32>,
    pub status: TaskStatus,
    /// Number of structural edits applied to recover this task. Bounded.
    #[serde(default)]
    pub replan_count: u32,
    /// Text description of "done" for this task.
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Reason the task was skipped, when `status` is `Skipped`.
    #[serde(default)]
    pub skip_reason: Option<String>,
    /// Execution history for this task.
    #[serde(default)]
    pub observations: Vec<Observation>,
}

impl Task {
    /// Create a pending task with no tool binding.
    pub fn new(position: u32, description: impl Into<String>) -> Self {
        Self {
            position,
            description: description.into(),
            tool_name: None,
            parameters: Map::new(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            replan_count: 0,
            acceptance_criteria: String::new(),
            skip_reason: None,
            observations: Vec::new(),
        }
    }

    pub fn observe(&mut self, kind: &str, detail: impl Into<String>) {
        self.observations.push(Observation {
            kind: kind.to_string(),
            detail: detail.into(),
        });
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped;
        self.skip_reason = Some(reason.to_string());
    }
}

/// The ordered, versioned set of tasks for one mission.
///
/// Identity is immutable; content mutates under the enclosing document's
/// monotonically increasing version (see [`crate::store`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// The mission statement this plan was generated for.
    #[serde(default)]
    pub mission: String,
    pub tasks: Vec<Task>,
    /// Free-form planner/oracle notes, appended by `update_plan` actions.
    #[serde(default)]
    pub notes: String,
}

impl Plan {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mission: String::new(),
            tasks: Vec::new(),
            notes: String::new(),
        }
    }

    pub fn task(&self, position: u32) -> Option<&Task> {
        self.tasks.iter().find(|t| t.position == position)
    }

    pub fn task_mut(&mut self, position: u32) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.position == position)
    }

    /// Largest position currently in use, or `None` for an empty plan.
    pub fn max_position(&self) -> Option<u32> {
        self.tasks.iter().map(|t| t.position).max()
    }

    /// Canonical ordering: ascending by position.
    pub fn sort_tasks(&mut self) {
        self.tasks.sort_by_key(|t| t.position);
    }

    /// Append notes, separated by a newline when notes already exist.
    pub fn append_notes(&mut self, notes: &str) {
        let trimmed = notes.trim();
        if trimmed.is_empty() {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(trimmed);
    }
}
