//! Dependency validation for plans.
//!
//! Pure checks over the dependency graph that the JSON schema cannot
//! express: reference validity, position uniqueness, and cycle freedom.
//! Must run after every structural edit and before persisting; a failing
//! validation rolls the edit back instead of persisting a corrupt plan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{bail, Result};

use crate::core::plan::{Plan, TaskStatus};

/// A structural defect in a plan's dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// A cycle through the listed positions (restricted to non-skipped tasks).
    Circular { positions: Vec<u32> },
    /// A task references a position that does not exist.
    Dangling { position: u32, missing: u32 },
    /// Two tasks share the same position.
    DuplicatePosition { position: u32 },
    /// A task depends on itself.
    SelfDependency { position: u32 },
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::Circular { positions } => {
                let cycle: Vec<String> = positions.iter().map(u32::to_string).collect();
                write!(f, "circular dependency through [{}]", cycle.join(" -> "))
            }
            DependencyError::Dangling { position, missing } => {
                write!(f, "task {position} depends on missing position {missing}")
            }
            DependencyError::DuplicatePosition { position } => {
                write!(f, "duplicate position {position}")
            }
            DependencyError::SelfDependency { position } => {
                write!(f, "task {position} depends on itself")
            }
        }
    }
}

/// Check a plan for dependency defects. Returns all violations found.
pub fn validate_dependencies(plan: &Plan) -> Vec<DependencyError> {
    let mut errors = Vec::new();

    let mut seen = BTreeSet::new();
    for task in &plan.tasks {
        if !seen.insert(task.position) {
            errors.push(DependencyError::DuplicatePosition {
                position: task.position,
            });
        }
    }

    for task in &plan.tasks {
        for dep in &task.dependencies {
            if *dep == task.position {
                errors.push(DependencyError::SelfDependency {
                    position: task.position,
                });
            } else if !seen.contains(dep) {
                errors.push(DependencyError::Dangling {
                    position: task.position,
                    missing: *dep,
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(plan) {
        errors.push(DependencyError::Circular { positions: cycle });
    }

    errors
}

/// Validate and convert violations into an error suitable for rollback paths.
pub fn ensure_valid(plan: &Plan) -> Result<()> {
    let errors = validate_dependencies(plan);
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = errors.iter().map(DependencyError::to_string).collect();
    bail!("plan dependency validation failed: {}", messages.join("; "));
}

/// Depth-first cycle search over non-skipped tasks. Returns the first cycle
/// found as a position path.
fn find_cycle(plan: &Plan) -> Option<Vec<u32>> {
    // Skipped tasks are out of the execution graph; edges through them are
    // ignored, matching eligibility semantics.
    let graph: BTreeMap<u32, &BTreeSet<u32>> = plan
        .tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Skipped)
        .map(|t| (t.position, &t.dependencies))
        .collect();

    let mut visited = BTreeSet::new();
    let mut stack = Vec::new();
    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        if let Some(cycle) = visit(start, &graph, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    position: u32,
    graph: &BTreeMap<u32, &BTreeSet<u32>>,
    visited: &mut BTreeSet<u32>,
    stack: &mut Vec<u32>,
) -> Option<Vec<u32>> {
    if let Some(at) = stack.iter().position(|&p| p == position) {
        let mut cycle = stack[at..].to_vec();
        cycle.push(position);
        return Some(cycle);
    }
    if visited.contains(&position) {
        return None;
    }
    stack.push(position);
    if let Some(deps) = graph.get(&position) {
        for &dep in deps.iter() {
            if !graph.contains_key(&dep) {
                // Dangling or skipped; reported elsewhere or ignored.
                continue;
            }
            if let Some(cycle) = visit(dep, graph, visited, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    visited.insert(position);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_tasks, task};

    #[test]
    fn valid_chain_passes() {
        let plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0]), task(2, &[1])]);
        assert!(validate_dependencies(&plan).is_empty());
        assert!(ensure_valid(&plan).is_ok());
    }

    #[test]
    fn reports_dangling_reference() {
        let plan = plan_with_tasks(vec![task(0, &[7])]);
        let errors = validate_dependencies(&plan);
        assert_eq!(
            errors,
            vec![DependencyError::Dangling {
                position: 0,
                missing: 7
            }]
        );
    }

    #[test]
    fn reports_cycle_with_path() {
        let plan = plan_with_tasks(vec![task(0, &[2]), task(1, &[0]), task(2, &[1])]);
        let errors = validate_dependencies(&plan);
        assert!(errors
            .iter()
            .any(|e| matches!(e, DependencyError::Circular { .. })));
        let err = ensure_valid(&plan).expect_err("cycle must fail validation");
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn reports_self_dependency_and_duplicates() {
        let plan = plan_with_tasks(vec![task(0, &[0]), task(1, &[]), task(1, &[])]);
        let errors = validate_dependencies(&plan);
        assert!(errors
            .iter()
            .any(|e| matches!(e, DependencyError::SelfDependency { position: 0 })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, DependencyError::DuplicatePosition { position: 1 })));
    }

    /// Skipped tasks are outside the execution graph, so a cycle that only
    /// exists through a skipped task is not a violation.
    #[test]
    fn cycle_through_skipped_task_is_ignored() {
        let mut plan = plan_with_tasks(vec![task(0, &[1]), task(1, &[0])]);
        plan.task_mut(1).unwrap().skip("decomposed");
        let errors = validate_dependencies(&plan);
        assert!(!errors
            .iter()
            .any(|e| matches!(e, DependencyError::Circular { .. })));
    }
}
