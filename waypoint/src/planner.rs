//! Initial plan generation from a mission statement.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, instrument};

use crate::core::deps::ensure_valid;
use crate::core::plan::{Plan, Task};
use crate::oracle::{
    request_decision, Decision, DecisionKind, Message, Oracle, OracleRequest, Role, TaskSpec,
};
use crate::prompt::PromptBuilder;
use crate::tools::ToolSchema;

/// Bounds on the planning step.
#[derive(Debug, Clone)]
pub struct PlannerLimits {
    pub prompt_budget_bytes: usize,
    pub oracle_timeout: Duration,
    pub oracle_max_retries: u32,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            prompt_budget_bytes: crate::prompt::DEFAULT_PROMPT_BUDGET_BYTES,
            oracle_timeout: Duration::from_secs(60),
            oracle_max_retries: 2,
        }
    }
}

/// Ask the oracle for an initial plan and materialize it.
///
/// The oracle returns tasks with dependencies as zero-based indices into its
/// own response; those become stable positions 0..n. A plan that references
/// unknown tools or fails dependency validation is rejected outright rather
/// than partially accepted.
#[instrument(skip_all, fields(plan_id))]
pub fn build_initial_plan(
    oracle: &dyn Oracle,
    plan_id: &str,
    mission: &str,
    tool_schemas: &[ToolSchema],
    memory_context: Option<String>,
    limits: &PlannerLimits,
) -> Result<Plan> {
    if mission.trim().is_empty() {
        return Err(anyhow!("mission must not be empty"));
    }

    let prompt = PromptBuilder::new(limits.prompt_budget_bytes)
        .build_plan(mission, tool_schemas, memory_context.as_deref())
        .context("render planning prompt")?;

    let request = OracleRequest {
        messages: vec![Message {
            role: Role::User,
            content: prompt,
        }],
        tool_schemas: tool_schemas.to_vec(),
        memory_context,
        expects: DecisionKind::Plan,
    };

    let decision = request_decision(
        oracle,
        &request,
        limits.oracle_timeout,
        limits.oracle_max_retries,
    )
    .context("request initial plan")?;

    let Decision::Plan(response) = decision else {
        return Err(anyhow!("oracle returned a non-plan decision"));
    };

    let mut plan = materialize(plan_id, mission, &response.tasks, tool_schemas)?;
    plan.append_notes(&response.notes);
    ensure_valid(&plan).context("oracle produced an invalid plan")?;
    debug!(tasks = plan.tasks.len(), "initial plan accepted");
    Ok(plan)
}

fn materialize(
    plan_id: &str,
    mission: &str,
    specs: &[TaskSpec],
    tool_schemas: &[ToolSchema],
) -> Result<Plan> {
    if specs.is_empty() {
        return Err(anyhow!("oracle returned an empty plan"));
    }
    let mut plan = Plan::new(plan_id);
    plan.mission = mission.to_string();
    for (index, spec) in specs.iter().enumerate() {
        let position = index as u32;
        if let Some(tool) = &spec.tool_name {
            if !tool_schemas.iter().any(|s| &s.name == tool) {
                return Err(anyhow!(
                    "plan task {position} references unknown tool '{tool}'"
                ));
            }
        }
        let mut dependencies = BTreeSet::new();
        for dep in &spec.dependencies {
            if *dep >= position {
                return Err(anyhow!(
                    "plan task {position} has a forward or self dependency on {dep}"
                ));
            }
            dependencies.insert(*dep);
        }
        let mut task = Task::new(position, spec.description.clone());
        task.tool_name = spec.tool_name.clone();
        task.parameters = spec.parameters.clone();
        task.acceptance_criteria = spec.acceptance_criteria.clone();
        task.dependencies = dependencies;
        plan.tasks.push(task);
    }
    Ok(plan)
}
