//! Recovery replanning: propose a strategy for a failed task and apply it as
//! a structural plan edit.
//!
//! Three edits exist: retry with new parameters, substitute the tool, or
//! decompose the task into a chain of subtasks. Every edit is validated by
//! the dependency validator before it is kept; a failing validation rolls
//! the edit back and the task is marked failed, terminally.

use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::time::Duration;
use tracing::{debug, warn};

use anyhow::Result;

use crate::core::context::FailureContext;
use crate::core::deps::ensure_valid;
use crate::core::plan::{Plan, Task, TaskStatus};
use crate::oracle::{
    request_decision, Decision, DecisionKind, Message, Oracle, OracleRequest, Role, TaskSpec,
};
use crate::prompt::render_replan_prompt;
use crate::tools::ToolSchema;

/// Strategy family, for reporting and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RetryWithParams,
    SubstituteTool,
    Decompose,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::RetryWithParams => "retry_with_params",
            StrategyKind::SubstituteTool => "substitute_tool",
            StrategyKind::Decompose => "decompose",
        }
    }
}

/// The structural edit a strategy carries. Closed set so the apply path is
/// exhaustively matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyEdit {
    RetryWithParams {
        #[serde(default)]
        parameters: Map<String, serde_json::Value>,
    },
    SubstituteTool {
        tool: String,
        #[serde(default)]
        parameters: Map<String, serde_json::Value>,
    },
    Decompose {
        subtasks: Vec<TaskSpec>,
    },
}

/// Oracle-proposed recovery strategy. Ephemeral: discarded after application;
/// only the resulting task mutation persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanStrategy {
    #[serde(flatten)]
    pub edit: StrategyEdit,
    pub rationale: String,
    /// Oracle self-assessed confidence, 0.0–1.0.
    pub confidence: f64,
}

impl ReplanStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self.edit {
            StrategyEdit::RetryWithParams { .. } => StrategyKind::RetryWithParams,
            StrategyEdit::SubstituteTool { .. } => StrategyKind::SubstituteTool,
            StrategyEdit::Decompose { .. } => StrategyKind::Decompose,
        }
    }
}

/// Bounds on the propose step.
#[derive(Debug, Clone)]
pub struct ReplanLimits {
    /// Strategies below this confidence are discarded.
    pub min_confidence: f64,
    /// Tasks at or beyond this replan count are not recovered again.
    pub max_replans: u32,
    pub oracle_timeout: Duration,
    pub oracle_max_retries: u32,
}

impl Default for ReplanLimits {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_replans: 2,
            oracle_timeout: Duration::from_secs(10),
            oracle_max_retries: 2,
        }
    }
}

/// Ask the oracle for a recovery strategy for `task`.
///
/// Returns `None` when the task's replan budget is exhausted, the oracle
/// cannot produce a well-formed strategy, or the strategy's confidence is
/// below the floor. `None` means the task fails terminally.
pub fn propose(
    oracle: &dyn Oracle,
    task: &Task,
    failure: &FailureContext,
    tool_schemas: &[ToolSchema],
    memory_context: Option<String>,
    limits: &ReplanLimits,
) -> Option<ReplanStrategy> {
    if task.replan_count >= limits.max_replans {
        debug!(
            position = task.position,
            replan_count = task.replan_count,
            "replan budget exhausted"
        );
        return None;
    }

    let prompt = match render_replan_prompt(task, failure, memory_context.as_deref()) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %err, "failed to render replan prompt");
            return None;
        }
    };

    let request = OracleRequest {
        messages: vec![Message {
            role: Role::User,
            content: prompt,
        }],
        tool_schemas: tool_schemas.to_vec(),
        memory_context,
        expects: DecisionKind::Recovery,
    };

    let decision = match request_decision(
        oracle,
        &request,
        limits.oracle_timeout,
        limits.oracle_max_retries,
    ) {
        Ok(decision) => decision,
        Err(err) => {
            warn!(position = task.position, err = %err, "oracle produced no recovery strategy");
            return None;
        }
    };

    let Decision::Recovery(strategy) = decision else {
        warn!(position = task.position, "oracle returned a non-recovery decision");
        return None;
    };

    if strategy.confidence < limits.min_confidence {
        debug!(
            position = task.position,
            confidence = strategy.confidence,
            "discarding low-confidence strategy"
        );
        return None;
    }

    Some(strategy)
}

/// Result of applying a strategy to a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Edit applied and validated; the task (or its subtask chain) is
    /// pending again.
    Applied { kind: StrategyKind },
    /// Edit produced an invalid plan; it was rolled back and the task is
    /// failed terminally.
    RolledBack { reason: String },
}

/// Apply `strategy` to the failed task at `position`, in place.
///
/// The plan is only mutated if the edited plan passes dependency
/// validation; otherwise the original plan is restored and the task is
/// marked failed.
pub fn apply(plan: &mut Plan, position: u32, strategy: &ReplanStrategy) -> Result<ApplyOutcome> {
    let original = plan.clone();
    let kind = strategy.kind();

    apply_edit(plan, position, strategy)?;

    if let Err(err) = ensure_valid(plan) {
        warn!(position, err = %err, "replan edit produced an invalid plan, rolling back");
        *plan = original;
        if let Some(task) = plan.task_mut(position) {
            task.status = TaskStatus::Failed;
            task.observe("replan", format!("edit rolled back: {err}"));
        }
        return Ok(ApplyOutcome::RolledBack {
            reason: err.to_string(),
        });
    }

    if let Some(task) = plan.task_mut(position) {
        task.observe(
            "replan",
            format!("{}: {}", kind.as_str(), strategy.rationale),
        );
    }
    plan.sort_tasks();
    Ok(ApplyOutcome::Applied { kind })
}

fn apply_edit(plan: &mut Plan, position: u32, strategy: &ReplanStrategy) -> Result<()> {
    match &strategy.edit {
        StrategyEdit::RetryWithParams { parameters } => {
            let task = expect_task(plan, position)?;
            task.parameters = parameters.clone();
            task.status = TaskStatus::Pending;
            task.replan_count += 1;
        }
        StrategyEdit::SubstituteTool { tool, parameters } => {
            // Same position, so dependents are unaffected.
            let task = expect_task(plan, position)?;
            task.tool_name = Some(tool.clone());
            task.parameters = parameters.clone();
            task.status = TaskStatus::Pending;
            task.replan_count += 1;
        }
        StrategyEdit::Decompose { subtasks } => {
            decompose(plan, position, subtasks)?;
        }
    }
    Ok(())
}

/// Insert a chain of subtasks replacing the task at `position`.
///
/// Positions are stable ordinals, so subtasks get fresh positions after the
/// current maximum. The chain head inherits the original's dependencies,
/// each subtask depends on the previous, dependents of the original are
/// re-pointed to the chain tail, and the original is skipped.
fn decompose(plan: &mut Plan, position: u32, subtasks: &[TaskSpec]) -> Result<()> {
    if subtasks.is_empty() {
        anyhow::bail!("decompose strategy carried no subtasks");
    }
    let original = expect_task(plan, position)?;
    let inherited_deps = original.dependencies.clone();
    let replan_count = original.replan_count + 1;

    let mut next_position = plan.max_position().map_or(0, |p| p + 1);
    let mut prev: Option<u32> = None;
    let mut new_tasks = Vec::with_capacity(subtasks.len());
    for spec in subtasks {
        let mut task = Task::new(next_position, spec.description.clone());
        task.tool_name = spec.tool_name.clone();
        task.parameters = spec.parameters.clone();
        task.acceptance_criteria = spec.acceptance_criteria.clone();
        task.replan_count = replan_count;
        task.dependencies = match prev {
            Some(prev_position) => [prev_position].into_iter().collect(),
            None => inherited_deps.clone(),
        };
        prev = Some(next_position);
        next_position += 1;
        new_tasks.push(task);
    }
    let tail = prev.expect("non-empty chain has a tail");

    for task in &mut plan.tasks {
        if task.position != position && task.dependencies.remove(&position) {
            task.dependencies.insert(tail);
        }
    }

    plan.tasks.extend(new_tasks);
    expect_task(plan, position)?.skip("decomposed");
    Ok(())
}

fn expect_task(plan: &mut Plan, position: u32) -> Result<&mut Task> {
    plan.task_mut(position)
        .ok_or_else(|| anyhow::anyhow!("task at position {position} not found"))
}
