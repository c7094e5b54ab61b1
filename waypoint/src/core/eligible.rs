//! Eligibility selection for the execution loop.

use crate::core::plan::{Plan, TaskStatus};

/// Structured selection outcome for one scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// All tasks are terminal.
    Complete,
    /// The lowest-position eligible task.
    Eligible(u32),
    /// Non-terminal tasks remain but none is eligible (dependencies failed,
    /// were skipped, or are still pending behind them).
    Blocked { pending: Vec<u32> },
}

/// A task is eligible when it is `Pending` and every dependency is
/// `Completed`. `Skipped` or `Failed` dependencies permanently block a task
/// unless the replanner re-points them.
pub fn is_eligible(plan: &Plan, position: u32) -> bool {
    let Some(task) = plan.task(position) else {
        return false;
    };
    if task.status != TaskStatus::Pending {
        return false;
    }
    task.dependencies.iter().all(|dep| {
        plan.task(*dep)
            .is_some_and(|d| d.status == TaskStatus::Completed)
    })
}

/// Select the next task to run: the lowest-position eligible task.
pub fn next_eligible(plan: &Plan) -> SelectOutcome {
    let mut pending = Vec::new();
    let mut best: Option<u32> = None;
    for task in &plan.tasks {
        if task.status.is_terminal() {
            continue;
        }
        pending.push(task.position);
        if is_eligible(plan, task.position) && best.is_none_or(|b| task.position < b) {
            best = Some(task.position);
        }
    }
    match best {
        Some(position) => SelectOutcome::Eligible(position),
        None if pending.is_empty() => SelectOutcome::Complete,
        None => {
            pending.sort_unstable();
            SelectOutcome::Blocked { pending }
        }
    }
}
