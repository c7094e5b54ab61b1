//! The execution loop: select a task, ask the oracle for one action, act,
//! observe, repeat.
//!
//! The loop is resumable at every boundary. Suspension is plain state: a
//! pending question or approval is written into the session context and the
//! process can exit; a later step picks up exactly where it stopped. Nothing
//! here blocks on a human.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::approval::{self, ApprovalPolicy, GateOutcome};
use crate::core::budget::check_step_budget;
use crate::core::context::{ApprovalDecision, FailureContext, PendingQuestion, SessionContext};
use crate::core::eligible::{next_eligible, SelectOutcome};
use crate::core::plan::{Plan, TaskStatus};
use crate::events::EngineEvent;
use crate::memory::{self, Lesson, MemoryStore};
use crate::oracle::{
    request_decision, Action, Decision, DecisionKind, Message, Oracle, OracleRequest, Role,
};
use crate::prompt::PromptBuilder;
use crate::replan::{self, ApplyOutcome, ReplanLimits};
use crate::tools::{ErrorKind, ToolOutcome, ToolRegistry};

/// Knobs for one engine instance. Derived from [`crate::config::EngineConfig`]
/// at the session boundary.
#[derive(Debug, Clone)]
pub struct LoopLimits {
    pub max_steps: u32,
    pub tool_timeout: Duration,
    pub prompt_budget_bytes: usize,
    pub approval_policy: ApprovalPolicy,
    pub oracle_timeout: Duration,
    pub oracle_max_retries: u32,
    pub replan: ReplanLimits,
    pub memory_max_lessons: usize,
    pub memory_budget_bytes: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: 50,
            tool_timeout: Duration::from_secs(120),
            prompt_budget_bytes: crate::prompt::DEFAULT_PROMPT_BUDGET_BYTES,
            approval_policy: ApprovalPolicy::Prompt,
            oracle_timeout: Duration::from_secs(60),
            oracle_max_retries: 2,
            replan: ReplanLimits::default(),
            memory_max_lessons: 5,
            memory_budget_bytes: 2_000,
        }
    }
}

/// Why a step (or the loop) returned control to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// State advanced; another step may follow.
    Progressed,
    /// Every task is terminal.
    Complete,
    /// Non-terminal tasks remain but none can run.
    Blocked { pending: Vec<u32> },
    /// Suspended on a clarification question.
    AwaitingAnswer,
    /// Suspended on an approval decision.
    AwaitingApproval,
}

impl StepOutcome {
    /// True when the loop should stop calling `run_step`.
    pub fn is_stop(&self) -> bool {
        !matches!(self, StepOutcome::Progressed)
    }
}

/// One engine instance bound to its collaborators. Owns no session state;
/// plans and contexts flow through the step functions so callers control
/// persistence.
pub struct Engine<'a> {
    oracle: &'a dyn Oracle,
    tools: &'a ToolRegistry,
    memory: Arc<dyn MemoryStore>,
    limits: LoopLimits,
}

impl<'a> Engine<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        tools: &'a ToolRegistry,
        memory: Arc<dyn MemoryStore>,
        limits: LoopLimits,
    ) -> Self {
        Self {
            oracle,
            tools,
            memory,
            limits,
        }
    }

    /// Advance the session by at most one action.
    ///
    /// A decided approval is consumed before anything else. An undecided
    /// suspension returns immediately without consuming budget. Budget
    /// exhaustion surfaces as a downcastable
    /// [`crate::core::budget::BudgetExceededError`].
    #[instrument(skip_all, fields(plan_id = %plan.id, steps_taken = context.steps_taken))]
    pub fn run_step(
        &self,
        plan: &mut Plan,
        context: &mut SessionContext,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        if let Some(pending) = &context.pending_approval {
            if let Some(decision) = pending.decision {
                return self.resume_approval(plan, context, decision, emit);
            }
            return Ok(StepOutcome::AwaitingApproval);
        }
        if context.pending_question.is_some() {
            return Ok(StepOutcome::AwaitingAnswer);
        }

        let position = match next_eligible(plan) {
            SelectOutcome::Complete => {
                emit(&EngineEvent::MissionComplete);
                return Ok(StepOutcome::Complete);
            }
            SelectOutcome::Blocked { pending } => {
                debug!(?pending, "no eligible task");
                return Ok(StepOutcome::Blocked { pending });
            }
            SelectOutcome::Eligible(position) => position,
        };

        check_step_budget(context.steps_taken, self.limits.max_steps)?;
        context.steps_taken += 1;

        self.execute_action(plan, context, position, emit)
    }

    /// Run steps until the loop suspends, blocks, completes, or errors. The
    /// `save` callback persists state after every step so a crash loses at
    /// most the step in flight.
    pub fn run_loop(
        &self,
        plan: &mut Plan,
        context: &mut SessionContext,
        emit: &mut dyn FnMut(&EngineEvent),
        mut save: impl FnMut(&Plan, &SessionContext) -> Result<()>,
    ) -> Result<StepOutcome> {
        loop {
            let outcome = match self.run_step(plan, context, emit) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Persist consumed budget and observations before failing.
                    save(plan, context).context("save after step failure")?;
                    return Err(err);
                }
            };
            save(plan, context).context("save after step")?;
            if outcome.is_stop() {
                return Ok(outcome);
            }
        }
    }

    /// Ask the oracle for the next action on the selected task and apply it.
    fn execute_action(
        &self,
        plan: &mut Plan,
        context: &mut SessionContext,
        position: u32,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        {
            let task = expect_task(plan, position)?;
            task.status = TaskStatus::InProgress;
        }

        let memory_context = self.recall(plan, position);
        let schemas = self.tools.schemas();
        let prompt = {
            let task = plan.task(position).expect("task exists");
            PromptBuilder::new(self.limits.prompt_budget_bytes)
                .build_action(plan, task, context, &schemas, memory_context.as_deref())
                .context("render action prompt")?
        };

        let request = OracleRequest {
            messages: vec![Message {
                role: Role::User,
                content: prompt,
            }],
            tool_schemas: schemas,
            memory_context: memory_context.clone(),
            expects: DecisionKind::Action,
        };

        let decision = match request_decision(
            self.oracle,
            &request,
            self.limits.oracle_timeout,
            self.limits.oracle_max_retries,
        ) {
            Ok(decision) => decision,
            Err(err) => {
                // A broken oracle is a task failure, routed through recovery
                // like any other.
                warn!(position, err = %err, "oracle failed for action decision");
                let failure = failure_context(plan, position, None, ErrorKind::Internal, &err.to_string());
                return self.fail_task(plan, position, failure, memory_context, emit);
            }
        };

        let Decision::Action(thought_action) = decision else {
            let failure = failure_context(
                plan,
                position,
                None,
                ErrorKind::Internal,
                "oracle returned a non-action decision",
            );
            return self.fail_task(plan, position, failure, memory_context, emit);
        };

        emit(&EngineEvent::Thought {
            position,
            thought: thought_action.thought.clone(),
        });
        emit(&EngineEvent::Action {
            position,
            action: thought_action.action.name().to_string(),
        });

        match thought_action.action {
            Action::Complete { summary } => {
                let task = expect_task(plan, position)?;
                task.status = TaskStatus::Completed;
                task.observe("completed", summary.clone());
                let replans = task.replan_count;
                emit(&EngineEvent::TaskCompleted { position, summary });
                if replans > 0 {
                    self.record_lesson(plan, position);
                }
                // The mission ends here; whatever is still pending is moot.
                for task in &mut plan.tasks {
                    if task.status == TaskStatus::Pending {
                        task.skip("mission completed early");
                        emit(&EngineEvent::TaskSkipped {
                            position: task.position,
                            reason: "mission completed early".to_string(),
                        });
                    }
                }
                emit(&EngineEvent::MissionComplete);
                Ok(StepOutcome::Complete)
            }
            Action::AskUser { key, question } => {
                // Revert to pending so the same task is re-selected once the
                // answer arrives.
                let task = expect_task(plan, position)?;
                task.status = TaskStatus::Pending;
                task.observe("ask_user", format!("{key}: {question}"));
                context.pending_question = Some(PendingQuestion {
                    key: key.clone(),
                    question: question.clone(),
                    position,
                });
                emit(&EngineEvent::AskUser {
                    position,
                    key,
                    question,
                });
                Ok(StepOutcome::AwaitingAnswer)
            }
            Action::UpdatePlan { notes } => {
                plan.append_notes(&notes);
                let task = expect_task(plan, position)?;
                task.status = TaskStatus::Pending;
                task.observe("update_plan", notes);
                Ok(StepOutcome::Progressed)
            }
            Action::ToolCall { tool, parameters } => {
                self.dispatch_tool(plan, context, position, &tool, parameters, memory_context, emit)
            }
        }
    }

    /// Gate and execute a tool call chosen by the oracle.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_tool(
        &self,
        plan: &mut Plan,
        context: &mut SessionContext,
        position: u32,
        tool_name: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
        memory_context: Option<String>,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        let Some(tool) = self.tools.get(tool_name) else {
            let failure = failure_context(
                plan,
                position,
                Some(tool_name),
                ErrorKind::NotFound,
                &format!("no tool named '{tool_name}' is registered"),
            );
            return self.fail_task(plan, position, failure, memory_context, emit);
        };

        match approval::check(tool, &parameters, position, context, self.limits.approval_policy) {
            GateOutcome::Allowed { approver } => {
                if let Some(approver) = approver {
                    emit(&EngineEvent::ApprovalDecided {
                        position,
                        tool: tool_name.to_string(),
                        decision: ApprovalDecision::Approved,
                        approver,
                    });
                }
                let outcome = tool.execute(&parameters, self.limits.tool_timeout);
                self.observe_tool_outcome(
                    plan,
                    position,
                    tool_name,
                    parameters,
                    outcome,
                    memory_context,
                    emit,
                )
            }
            GateOutcome::Denied { approver } => {
                emit(&EngineEvent::ApprovalDecided {
                    position,
                    tool: tool_name.to_string(),
                    decision: ApprovalDecision::Denied,
                    approver,
                });
                let task = expect_task(plan, position)?;
                task.skip("approval denied");
                emit(&EngineEvent::TaskSkipped {
                    position,
                    reason: "approval denied".to_string(),
                });
                Ok(StepOutcome::Progressed)
            }
            GateOutcome::Suspended => {
                let pending = context.pending_approval.as_ref().expect("just suspended");
                emit(&EngineEvent::ApprovalRequired {
                    position,
                    tool: pending.tool.clone(),
                    preview: pending.preview.clone(),
                    risk: pending.risk,
                });
                info!(position, tool = tool_name, "suspended awaiting approval");
                Ok(StepOutcome::AwaitingApproval)
            }
        }
    }

    /// Consume a decided approval: run or skip the persisted call.
    fn resume_approval(
        &self,
        plan: &mut Plan,
        context: &mut SessionContext,
        decision: ApprovalDecision,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        let pending = context.pending_approval.take().expect("checked by caller");
        let position = pending.position;

        match decision {
            ApprovalDecision::Denied => {
                let task = expect_task(plan, position)?;
                task.skip("approval denied");
                emit(&EngineEvent::TaskSkipped {
                    position,
                    reason: "approval denied".to_string(),
                });
                Ok(StepOutcome::Progressed)
            }
            ApprovalDecision::Approved => {
                check_step_budget(context.steps_taken, self.limits.max_steps)?;
                context.steps_taken += 1;
                let Some(tool) = self.tools.get(&pending.tool) else {
                    let failure = failure_context(
                        plan,
                        position,
                        Some(&pending.tool),
                        ErrorKind::NotFound,
                        "approved tool is no longer registered",
                    );
                    return self.fail_task(plan, position, failure, None, emit);
                };
                let outcome = tool.execute(&pending.parameters, self.limits.tool_timeout);
                let memory_context = self.recall(plan, position);
                self.observe_tool_outcome(
                    plan,
                    position,
                    &pending.tool,
                    pending.parameters,
                    outcome,
                    memory_context,
                    emit,
                )
            }
        }
    }

    /// Record a tool result, routing failures into recovery.
    #[allow(clippy::too_many_arguments)]
    fn observe_tool_outcome(
        &self,
        plan: &mut Plan,
        position: u32,
        tool_name: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
        outcome: ToolOutcome,
        memory_context: Option<String>,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        if outcome.success {
            let detail = outcome
                .data
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default();
            let task = expect_task(plan, position)?;
            task.observe("tool_result", &detail);
            task.status = TaskStatus::Completed;
            let replans = task.replan_count;
            emit(&EngineEvent::ToolResult {
                position,
                tool: tool_name.to_string(),
                success: true,
                detail,
            });
            if replans > 0 {
                self.record_lesson(plan, position);
            }
            return Ok(StepOutcome::Progressed);
        }

        let message = outcome.error.clone().unwrap_or_else(|| "tool failed".to_string());
        let kind = outcome.error_kind.unwrap_or(ErrorKind::Internal);
        emit(&EngineEvent::ToolResult {
            position,
            tool: tool_name.to_string(),
            success: false,
            detail: message.clone(),
        });
        let mut failure = failure_context(plan, position, Some(tool_name), kind, &message);
        failure.parameters = parameters;
        self.fail_task(plan, position, failure, memory_context, emit)
    }

    /// Mark the task failed and attempt a bounded structural recovery.
    fn fail_task(
        &self,
        plan: &mut Plan,
        position: u32,
        failure: FailureContext,
        memory_context: Option<String>,
        emit: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        {
            let task = expect_task(plan, position)?;
            task.status = TaskStatus::Failed;
            task.observe(
                "failure",
                format!("[{}] {}", failure.error_kind.as_str(), failure.error_message),
            );
        }

        let schemas = self.tools.schemas();
        let strategy = {
            let task = plan.task(position).expect("task exists");
            replan::propose(
                self.oracle,
                task,
                &failure,
                &schemas,
                memory_context,
                &self.limits.replan,
            )
        };

        let Some(strategy) = strategy else {
            emit(&EngineEvent::TaskFailed {
                position,
                reason: failure.error_message,
            });
            return Ok(StepOutcome::Progressed);
        };

        match replan::apply(plan, position, &strategy)? {
            ApplyOutcome::Applied { kind } => {
                emit(&EngineEvent::Replan {
                    position,
                    strategy: kind,
                    rationale: strategy.rationale.clone(),
                });
                Ok(StepOutcome::Progressed)
            }
            ApplyOutcome::RolledBack { reason } => {
                emit(&EngineEvent::TaskFailed { position, reason });
                Ok(StepOutcome::Progressed)
            }
        }
    }

    /// Advisory lesson recall; failures degrade to no memory.
    fn recall(&self, plan: &Plan, position: u32) -> Option<String> {
        if self.limits.memory_max_lessons == 0 {
            return None;
        }
        let task = plan.task(position)?;
        let query = format!("{} {}", task.description, plan.mission);
        match self.memory.retrieve(&query, self.limits.memory_max_lessons) {
            Ok(lessons) => memory::lessons_block(&lessons, self.limits.memory_budget_bytes),
            Err(err) => {
                warn!(err = %err, "lesson retrieval failed, continuing without memory");
                None
            }
        }
    }

    /// Store what worked for a task that needed recovery. Fire-and-forget.
    fn record_lesson(&self, plan: &Plan, position: u32) {
        let Some(task) = plan.task(position) else {
            return;
        };
        let resolution = task
            .observations
            .iter()
            .rev()
            .find(|o| o.kind == "replan" || o.kind == "completed")
            .map(|o| o.detail.clone())
            .unwrap_or_else(|| "completed after recovery".to_string());
        let lesson = Lesson {
            mission: plan.mission.clone(),
            task_description: task.description.clone(),
            tool_name: task.tool_name.clone(),
            resolution,
            replan_count: task.replan_count,
            recorded_at: chrono::Utc::now(),
        };
        memory::store_detached(Arc::clone(&self.memory), lesson);
    }
}

fn failure_context(
    plan: &Plan,
    position: u32,
    tool_name: Option<&str>,
    kind: ErrorKind,
    message: &str,
) -> FailureContext {
    let (attempts, observations) = plan
        .task(position)
        .map(|t| {
            (
                t.replan_count + 1,
                t.observations.iter().rev().take(5).rev().cloned().collect(),
            )
        })
        .unwrap_or((1, Vec::new()));
    FailureContext {
        tool_name: tool_name.map(str::to_string),
        parameters: serde_json::Map::new(),
        error_message: message.to_string(),
        error_kind: kind,
        attempt_count: attempts,
        recent_observations: observations,
    }
}

fn expect_task(plan: &mut Plan, position: u32) -> Result<&mut crate::core::plan::Task> {
    plan.task_mut(position)
        .ok_or_else(|| anyhow::anyhow!("task at position {position} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetExceededError;
    use crate::memory::NullMemoryStore;
    use crate::test_support::{plan_with_tasks, task, ScriptedOracle, StaticTool};
    use serde_json::json;

    fn engine<'a>(
        oracle: &'a ScriptedOracle,
        tools: &'a ToolRegistry,
        limits: LoopLimits,
    ) -> Engine<'a> {
        Engine::new(oracle, tools, Arc::new(NullMemoryStore), limits)
    }

    fn sink() -> impl FnMut(&EngineEvent) {
        |_e: &EngineEvent| {}
    }

    fn tool_call(tool: &str) -> serde_json::Value {
        json!({
            "thought": "use the tool",
            "action": {"type": "tool_call", "tool": tool, "parameters": {}}
        })
    }

    fn complete(summary: &str) -> serde_json::Value {
        json!({
            "thought": "criteria met",
            "action": {"type": "complete", "summary": summary}
        })
    }

    /// A successful tool call completes the task in the same step; no second
    /// oracle decision is needed.
    #[test]
    fn tool_success_completes_the_task() {
        let oracle = ScriptedOracle::new(vec![tool_call("echo")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::succeeding("echo")));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        let outcome = eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        assert_eq!(outcome, StepOutcome::Progressed);
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Completed);
        assert_eq!(ctx.steps_taken, 1);
    }

    #[test]
    fn tool_success_then_loop_reports_complete() {
        let oracle = ScriptedOracle::new(vec![tool_call("echo")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::succeeding("echo")));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut events = Vec::new();

        let outcome = eng
            .run_loop(&mut plan, &mut ctx, &mut |e| events.push(e.clone()), |_, _| Ok(()))
            .expect("loop");

        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Completed);
        assert_eq!(ctx.steps_taken, 1);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::MissionComplete)));
    }

    /// `complete` ends the mission early: every remaining pending task is
    /// skipped rather than run.
    #[test]
    fn complete_ends_mission_and_skips_remaining() {
        let oracle = ScriptedOracle::new(vec![complete("first result covers the mission")]);
        let tools = ToolRegistry::new();
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[]), task(1, &[])]);
        let mut ctx = SessionContext::default();
        let mut events = Vec::new();

        let outcome = eng
            .run_step(&mut plan, &mut ctx, &mut |e| events.push(e.clone()))
            .expect("step");

        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Completed);
        let skipped = plan.task(1).unwrap();
        assert_eq!(skipped.status, TaskStatus::Skipped);
        assert_eq!(skipped.skip_reason.as_deref(), Some("mission completed early"));
        assert_eq!(oracle.remaining(), 0);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TaskSkipped { position: 1, .. }
        )));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::MissionComplete)));
    }

    #[test]
    fn ask_user_suspends_and_reverts_task() {
        let oracle = ScriptedOracle::new(vec![json!({
            "thought": "need input",
            "action": {"type": "ask_user", "key": "region", "question": "which region?"}
        })]);
        let tools = ToolRegistry::new();
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        let outcome = eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        assert_eq!(outcome, StepOutcome::AwaitingAnswer);
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Pending);
        let pending = ctx.pending_question.as_ref().expect("question");
        assert_eq!(pending.key, "region");
        assert!(ctx.is_suspended());

        // A further step is a no-op while suspended.
        let outcome = eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        assert_eq!(outcome, StepOutcome::AwaitingAnswer);
        assert_eq!(ctx.steps_taken, 1);
    }

    #[test]
    fn gated_tool_suspends_then_runs_after_approval() {
        let oracle = ScriptedOracle::new(vec![tool_call("shell")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::succeeding("shell").gated()));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        let outcome = eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        assert_eq!(outcome, StepOutcome::AwaitingApproval);
        assert!(ctx.is_suspended());

        crate::approval::resolve(&mut ctx, crate::approval::ApprovalReply::Approve, "alice")
            .expect("resolve");
        assert!(!ctx.is_suspended());

        // Resume consumes the persisted call; success completes the task.
        let outcome = eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        assert_eq!(outcome, StepOutcome::Progressed);
        assert!(ctx.pending_approval.is_none());
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Completed);
    }

    /// A denial is a policy outcome, not a failure: the task is skipped and
    /// no failure event is reported.
    #[test]
    fn denied_approval_skips_the_task() {
        let oracle = ScriptedOracle::new(vec![tool_call("shell")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::succeeding("shell").gated()));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut events = Vec::new();
        let mut emit = |e: &EngineEvent| events.push(e.clone());

        eng.run_step(&mut plan, &mut ctx, &mut emit).expect("step");
        crate::approval::resolve(&mut ctx, crate::approval::ApprovalReply::Deny, "alice")
            .expect("resolve");
        eng.run_step(&mut plan, &mut ctx, &mut emit).expect("step");

        let t = plan.task(0).unwrap();
        assert_eq!(t.status, TaskStatus::Skipped);
        assert_eq!(t.skip_reason.as_deref(), Some("approval denied"));
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::TaskFailed { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TaskSkipped { position: 0, .. }
        )));
    }

    #[test]
    fn failed_tool_triggers_replan_then_succeeds() {
        let recovery = json!({
            "strategy": "substitute_tool",
            "tool": "echo",
            "parameters": {},
            "rationale": "flaky tool, use echo",
            "confidence": 0.9
        });
        let oracle = ScriptedOracle::new(vec![tool_call("flaky"), recovery, tool_call("echo")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::failing("flaky", ErrorKind::Network)));
        tools.register(Box::new(StaticTool::succeeding("echo")));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut events = Vec::new();

        let outcome = eng
            .run_loop(&mut plan, &mut ctx, &mut |e| events.push(e.clone()), |_, _| Ok(()))
            .expect("loop");

        assert_eq!(outcome, StepOutcome::Complete);
        let t = plan.task(0).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.replan_count, 1);
        assert_eq!(t.tool_name.as_deref(), Some("echo"));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Replan { .. })));
    }

    #[test]
    fn exhausted_replans_fail_terminally_and_block_dependents() {
        let recovery = json!({
            "strategy": "retry_with_params",
            "parameters": {},
            "rationale": "try again",
            "confidence": 0.9
        });
        let oracle = ScriptedOracle::new(vec![
            tool_call("flaky"),
            recovery.clone(),
            tool_call("flaky"),
            recovery,
            tool_call("flaky"),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::failing("flaky", ErrorKind::Network)));
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        let outcome = eng
            .run_loop(&mut plan, &mut ctx, &mut sink, |_, _| Ok(()))
            .expect("loop");

        assert_eq!(outcome, StepOutcome::Blocked { pending: vec![1] });
        let t = plan.task(0).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.replan_count, 2);
        assert_eq!(plan.task(1).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn step_budget_is_enforced_across_steps() {
        let oracle = ScriptedOracle::new(vec![tool_call("echo"), tool_call("echo")]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StaticTool::succeeding("echo")));
        let limits = LoopLimits {
            max_steps: 1,
            ..LoopLimits::default()
        };
        let eng = engine(&oracle, &tools, limits);

        let mut plan = plan_with_tasks(vec![task(0, &[]), task(1, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        eng.run_step(&mut plan, &mut ctx, &mut sink).expect("first step");
        let err = eng
            .run_step(&mut plan, &mut ctx, &mut sink)
            .expect_err("budget");
        assert!(err.downcast_ref::<BudgetExceededError>().is_some());
    }

    #[test]
    fn unknown_tool_fails_the_task() {
        let oracle = ScriptedOracle::new(vec![tool_call("missing")]);
        let tools = ToolRegistry::new();
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        eng.run_step(&mut plan, &mut ctx, &mut sink).expect("step");
        // No recovery scripted, so the task fails terminally.
        assert_eq!(plan.task(0).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn update_plan_appends_notes_and_continues() {
        let oracle = ScriptedOracle::new(vec![
            json!({
                "thought": "record the constraint",
                "action": {"type": "update_plan", "notes": "api rate limit is 10/s"}
            }),
            complete("done"),
        ]);
        let tools = ToolRegistry::new();
        let eng = engine(&oracle, &tools, LoopLimits::default());

        let mut plan = plan_with_tasks(vec![task(0, &[])]);
        let mut ctx = SessionContext::default();
        let mut sink = sink();

        let outcome = eng
            .run_loop(&mut plan, &mut ctx, &mut sink, |_, _| Ok(()))
            .expect("loop");
        assert_eq!(outcome, StepOutcome::Complete);
        assert!(plan.notes.contains("rate limit"));
    }
}
