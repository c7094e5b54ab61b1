//! Randomized structural properties of replan edits.
//!
//! Whatever sequence of recovery edits is applied, the plan must keep unique
//! positions and a sound dependency graph, and tasks must never exceed the
//! replan budget when edits flow through the proposal gate.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Map;

use waypoint::core::deps::validate_dependencies;
use waypoint::core::plan::{Plan, TaskStatus};
use waypoint::oracle::TaskSpec;
use waypoint::replan::{apply, ApplyOutcome, ReplanStrategy, StrategyEdit};
use waypoint::test_support::{plan_with_tasks, task};

fn random_plan(rng: &mut StdRng) -> Plan {
    let count = rng.gen_range(2..8u32);
    let tasks = (0..count)
        .map(|position| {
            let deps: Vec<u32> = (0..position)
                .filter(|_| rng.gen_bool(0.4))
                .collect();
            task(position, &deps)
        })
        .collect();
    plan_with_tasks(tasks)
}

fn random_edit(rng: &mut StdRng) -> StrategyEdit {
    match rng.gen_range(0..3) {
        0 => StrategyEdit::RetryWithParams {
            parameters: Map::new(),
        },
        1 => StrategyEdit::SubstituteTool {
            tool: format!("tool-{}", rng.gen_range(0..5)),
            parameters: Map::new(),
        },
        _ => StrategyEdit::Decompose {
            subtasks: (0..rng.gen_range(1..4))
                .map(|i| TaskSpec::described(&format!("subtask {i}")))
                .collect(),
        },
    }
}

fn strategy(edit: StrategyEdit) -> ReplanStrategy {
    ReplanStrategy {
        edit,
        rationale: "randomized recovery".to_string(),
        confidence: 0.9,
    }
}

/// Positions stay unique and the dependency graph stays valid across any
/// applied edit sequence.
#[test]
fn applied_edits_never_break_plan_structure() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..50 {
        let mut plan = random_plan(&mut rng);

        for _ in 0..6 {
            // Pick a non-terminal victim and fail it.
            let victims: Vec<u32> = plan
                .tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.position)
                .collect();
            let Some(&position) = victims.get(rng.gen_range(0..victims.len().max(1))) else {
                break;
            };
            plan.task_mut(position).unwrap().status = TaskStatus::Failed;

            let outcome = apply(&mut plan, position, &strategy(random_edit(&mut rng)))
                .expect("apply never errors on a present task");
            assert!(
                matches!(outcome, ApplyOutcome::Applied { .. }),
                "edits on a valid plan must validate"
            );

            let problems = validate_dependencies(&plan);
            assert!(problems.is_empty(), "invalid plan after edit: {problems:?}");

            let mut positions: Vec<u32> = plan.tasks.iter().map(|t| t.position).collect();
            positions.sort_unstable();
            positions.dedup();
            assert_eq!(positions.len(), plan.tasks.len(), "positions must stay unique");
        }
    }
}

/// Decompose never reuses a position, even across repeated decompositions.
#[test]
fn repeated_decompose_allocates_fresh_positions() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0])]);
    let mut seen: Vec<u32> = plan.tasks.iter().map(|t| t.position).collect();

    for _ in 0..5 {
        let open: Vec<u32> = plan
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.position)
            .collect();
        if open.is_empty() {
            break;
        }
        let position = open[rng.gen_range(0..open.len())];
        plan.task_mut(position).unwrap().status = TaskStatus::Failed;

        let before: Vec<u32> = plan.tasks.iter().map(|t| t.position).collect();
        apply(
            &mut plan,
            position,
            &strategy(StrategyEdit::Decompose {
                subtasks: vec![
                    TaskSpec::described("first half"),
                    TaskSpec::described("second half"),
                ],
            }),
        )
        .expect("apply");

        for t in &plan.tasks {
            if !before.contains(&t.position) {
                assert!(
                    !seen.contains(&t.position),
                    "position {} was reused",
                    t.position
                );
                seen.push(t.position);
            }
        }
    }
}

/// Retry and substitute keep the task count stable; only decompose grows the
/// plan, and only by the subtask count.
#[test]
fn edit_kinds_change_task_count_predictably() {
    let mut plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0])]);
    plan.task_mut(0).unwrap().status = TaskStatus::Failed;

    apply(
        &mut plan,
        0,
        &strategy(StrategyEdit::RetryWithParams {
            parameters: Map::new(),
        }),
    )
    .expect("retry");
    assert_eq!(plan.tasks.len(), 2);

    plan.task_mut(0).unwrap().status = TaskStatus::Failed;
    apply(
        &mut plan,
        0,
        &strategy(StrategyEdit::SubstituteTool {
            tool: "other".to_string(),
            parameters: Map::new(),
        }),
    )
    .expect("substitute");
    assert_eq!(plan.tasks.len(), 2);

    plan.task_mut(0).unwrap().status = TaskStatus::Failed;
    apply(
        &mut plan,
        0,
        &strategy(StrategyEdit::Decompose {
            subtasks: vec![
                TaskSpec::described("a"),
                TaskSpec::described("b"),
                TaskSpec::described("c"),
            ],
        }),
    )
    .expect("decompose");
    assert_eq!(plan.tasks.len(), 5);
}
