//! Prompt builders for the three oracle request shapes.
//!
//! Templates carry HTML comment section markers so rendered prompts can be
//! trimmed to a byte budget by dropping droppable sections before truncating
//! anything required.

use anyhow::Result;
use minijinja::{context, Environment};
use tracing::debug;

use crate::core::context::{FailureContext, SessionContext};
use crate::core::plan::{Plan, Task};
use crate::tools::ToolSchema;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const ACTION_TEMPLATE: &str = include_str!("prompts/action.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");

/// Default byte budget for a rendered prompt.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 24 * 1024;

const RECENT_OBSERVATIONS: usize = 5;

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("action", ACTION_TEMPLATE)
            .expect("action template should be valid");
        env.add_template("replan", REPLAN_TEMPLATE)
            .expect("replan template should be valid");
        Self { env }
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Full section content, marker excluded.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: memory -> plan -> answers -> observations
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    let drop_order = ["memory", "plan", "answers", "observations"];
    for key in drop_order {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // If still over budget, truncate the last section
    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        let last = sections.last_mut().unwrap();
        let before_len = last.content.len();
        if last.content.len() > allowed {
            if allowed > 12 {
                last.content.truncate(allowed - 12);
                last.content.push_str("\n[truncated]");
            } else {
                last.content.truncate(allowed);
            }
            debug!(
                section = last.key,
                before_len,
                after_len = last.content.len(),
                "truncated section for budget"
            );
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn describe_task(task: &Task) -> String {
    let mut out = format!(
        "position: {}\ndescription: {}\n",
        task.position, task.description
    );
    if let Some(tool) = &task.tool_name {
        out.push_str(&format!("tool: {tool}\n"));
    }
    if !task.parameters.is_empty() {
        let params = serde_json::to_string(&task.parameters).unwrap_or_default();
        out.push_str(&format!("parameters: {params}\n"));
    }
    if !task.acceptance_criteria.is_empty() {
        out.push_str(&format!("acceptance: {}\n", task.acceptance_criteria));
    }
    if task.replan_count > 0 {
        out.push_str(&format!("replans so far: {}\n", task.replan_count));
    }
    out.trim_end().to_string()
}

fn describe_plan(plan: &Plan) -> String {
    let mut lines: Vec<String> = plan
        .tasks
        .iter()
        .map(|t| {
            let deps = t
                .dependencies
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{} [{}] {}{}",
                t.position,
                t.status.as_str(),
                t.description,
                if deps.is_empty() {
                    String::new()
                } else {
                    format!(" (after {deps})")
                }
            )
        })
        .collect();
    if !plan.notes.is_empty() {
        lines.push(format!("notes: {}", plan.notes));
    }
    lines.join("\n")
}

fn describe_answers(context: &SessionContext) -> String {
    context
        .answers
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_observations(task: &Task) -> String {
    task.observations
        .iter()
        .rev()
        .take(RECENT_OBSERVATIONS)
        .rev()
        .map(|o| format!("[{}] {}", o.kind, o.detail))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_tools(schemas: &[ToolSchema]) -> String {
    serde_json::to_string_pretty(schemas).unwrap_or_else(|_| "[]".to_string())
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Prompt asking for an initial plan for `mission`.
    pub fn build_plan(
        &self,
        mission: &str,
        tool_schemas: &[ToolSchema],
        memory: Option<&str>,
    ) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("plan")?;
        let rendered = template.render(context! {
            mission => mission.trim(),
            tools => describe_tools(tool_schemas),
            memory => memory.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(self.finish(&rendered))
    }

    /// Prompt asking for the next action on `task`.
    pub fn build_action(
        &self,
        plan: &Plan,
        task: &Task,
        session: &SessionContext,
        tool_schemas: &[ToolSchema],
        memory: Option<&str>,
    ) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("action")?;
        let plan_summary = describe_plan(plan);
        let answers = describe_answers(session);
        let observations = describe_observations(task);
        let rendered = template.render(context! {
            task => describe_task(task),
            tools => describe_tools(tool_schemas),
            plan => (!plan_summary.is_empty()).then_some(plan_summary),
            answers => (!answers.is_empty()).then_some(answers),
            observations => (!observations.is_empty()).then_some(observations),
            memory => memory.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(self.finish(&rendered))
    }

    /// Prompt asking for a recovery strategy for a failed `task`.
    pub fn build_replan(
        &self,
        task: &Task,
        failure: &FailureContext,
        memory: Option<&str>,
    ) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("replan")?;
        let rendered = template.render(context! {
            task => describe_task(task),
            failure => failure.summary(),
            memory => memory.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(self.finish(&rendered))
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

/// Render a recovery prompt with the default budget.
pub fn render_replan_prompt(
    task: &Task,
    failure: &FailureContext,
    memory: Option<&str>,
) -> Result<String> {
    PromptBuilder::default().build_replan(task, failure, memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_tasks, task};

    fn failure() -> FailureContext {
        FailureContext {
            tool_name: Some("http_get".to_string()),
            parameters: serde_json::Map::new(),
            error_message: "connection refused".to_string(),
            error_kind: crate::tools::ErrorKind::Network,
            attempt_count: 1,
            recent_observations: vec![crate::core::plan::Observation {
                kind: "tool_result".to_string(),
                detail: "connection refused".to_string(),
            }],
        }
    }

    /// Sections appear in deterministic order: contract -> task -> failure ->
    /// memory.
    #[test]
    fn replan_prompt_ordering_is_stable() {
        let t = task(0, &[]);
        let content = PromptBuilder::new(10_000)
            .build_replan(&t, &failure(), Some("lesson: prefer curl"))
            .expect("render");

        let contract_pos = content.find("### Recovery Contract").expect("contract");
        let task_pos = content.find("### Failed Task").expect("task");
        let failure_pos = content.find("### Failure").expect("failure");
        let memory_pos = content.find("### Lessons").expect("memory");

        assert!(contract_pos < task_pos, "contract before task");
        assert!(task_pos < failure_pos, "task before failure");
        assert!(failure_pos < memory_pos, "failure before memory");
    }

    /// A tight budget drops the memory section while required sections
    /// survive.
    #[test]
    fn budget_drops_memory_before_required_sections() {
        let t = task(0, &[]);
        let lessons = "lesson ".repeat(500);
        let content = PromptBuilder::new(1_600)
            .build_replan(&t, &failure(), Some(&lessons))
            .expect("render");

        assert!(!content.contains("### Lessons"), "memory should be dropped");
        assert!(
            content.contains("### Recovery Contract"),
            "contract should remain"
        );
        assert!(content.contains("### Failed Task"), "task should remain");
        assert!(content.contains("### Failure"), "failure should remain");
    }

    /// Templates wrap content in XML tags for semantic structure.
    #[test]
    fn action_template_uses_xml_tags() {
        let plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0])]);
        let t = plan.task(0).unwrap().clone();
        let content = PromptBuilder::new(10_000)
            .build_action(&plan, &t, &SessionContext::default(), &[], None)
            .expect("render");

        assert!(content.contains("<contract>"), "should have contract tag");
        assert!(content.contains("</contract>"), "should close contract tag");
        assert!(content.contains("<task>"), "should have task tag");
        assert!(content.contains("</task>"), "should close task tag");
        assert!(content.contains("<plan>"), "should have plan tag");
    }

    #[test]
    fn plan_prompt_lists_tools() {
        let schema = ToolSchema {
            name: "shell".to_string(),
            description: "run a shell command".to_string(),
            parameters: serde_json::json!({"type": "object"}),
            requires_approval: true,
            risk_level: crate::tools::RiskLevel::High,
        };
        let content = PromptBuilder::new(10_000)
            .build_plan("ship the release", &[schema], None)
            .expect("render");
        assert!(content.contains("ship the release"));
        assert!(content.contains("\"shell\""));
    }
}
