//! Session operations: the external surface of the engine.
//!
//! Each operation loads the session from the store, advances it, and saves
//! under optimistic concurrency. The process may exit between any two
//! operations; all suspension state lives in the persisted document.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::approval::{self, ApprovalReply};
use crate::config::EngineConfig;
use crate::core::context::SessionContext;
use crate::core::deps::{validate_dependencies, DependencyError};
use crate::core::plan::Plan;
use crate::events::{EngineEvent, EventLog};
use crate::looping::{Engine, LoopLimits, StepOutcome};
use crate::memory::MemoryStore;
use crate::oracle::Oracle;
use crate::planner::{self, PlannerLimits};
use crate::replan::ReplanLimits;
use crate::store::{PlanStore, Snapshot};
use crate::tools::ToolRegistry;

/// Everything a session operation needs, wired once per process.
pub struct SessionManager {
    store: PlanStore,
    config: EngineConfig,
    oracle: Box<dyn Oracle>,
    tools: ToolRegistry,
    memory: Arc<dyn MemoryStore>,
}

impl SessionManager {
    pub fn new(
        store: PlanStore,
        config: EngineConfig,
        oracle: Box<dyn Oracle>,
        tools: ToolRegistry,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            store,
            config,
            oracle,
            tools,
            memory,
        }
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    /// Plan a new mission and run it until it suspends or finishes.
    pub fn submit_mission(
        &self,
        session_id: &str,
        mission: &str,
        on_event: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        if self.store.exists(session_id) {
            return Err(anyhow!("session '{session_id}' already exists"));
        }

        let schemas = self.tools.schemas();
        let memory_context = self.recall_for_mission(mission);
        let plan = planner::build_initial_plan(
            self.oracle.as_ref(),
            session_id,
            mission,
            &schemas,
            memory_context,
            &self.planner_limits(),
        )?;

        let context = SessionContext::default();
        let version = self.store.create(session_id, &plan, &context)?;
        info!(session_id, tasks = plan.tasks.len(), "mission planned");

        self.drive(session_id, plan, context, version, on_event)
    }

    /// Answer the pending clarification question and resume.
    pub fn submit_answer(
        &self,
        session_id: &str,
        answer: &str,
        on_event: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        let Snapshot {
            plan,
            mut context,
            version,
        } = self.store.load(session_id)?;

        let pending = context
            .pending_question
            .take()
            .ok_or_else(|| anyhow!("session '{session_id}' has no pending question"))?;
        context.answers.insert(pending.key, answer.to_string());

        self.drive(session_id, plan, context, version, on_event)
    }

    /// Decide the pending approval (y/n/trust) and resume.
    pub fn submit_approval(
        &self,
        session_id: &str,
        reply: ApprovalReply,
        approver: &str,
        on_event: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        let Snapshot {
            plan,
            mut context,
            version,
        } = self.store.load(session_id)?;

        approval::resolve(&mut context, reply, approver)?;
        let record = context
            .approval_history
            .last()
            .expect("resolve appended a record");
        on_event(&EngineEvent::ApprovalDecided {
            position: record.position,
            tool: record.tool.clone(),
            decision: record.decision,
            approver: record.approver.clone(),
        });

        self.drive(session_id, plan, context, version, on_event)
    }

    /// Read-only snapshot of the session.
    pub fn get_plan(&self, session_id: &str) -> Result<Snapshot> {
        self.store.load(session_id)
    }

    /// Structural problems in the stored plan, empty when sound.
    pub fn validate(&self, session_id: &str) -> Result<Vec<DependencyError>> {
        let snapshot = self.store.load(session_id)?;
        Ok(validate_dependencies(&snapshot.plan))
    }

    /// Run the loop, persisting after every step under the session's version.
    fn drive(
        &self,
        session_id: &str,
        mut plan: Plan,
        mut context: SessionContext,
        version: u64,
        on_event: &mut dyn FnMut(&EngineEvent),
    ) -> Result<StepOutcome> {
        let log = EventLog::new(&self.store.root().join(session_id));
        let mut emit = |event: &EngineEvent| {
            if let Err(err) = log.append(event) {
                warn!(err = %err, "failed to append event log");
            }
            on_event(event);
        };

        let engine = Engine::new(
            self.oracle.as_ref(),
            &self.tools,
            Arc::clone(&self.memory),
            self.loop_limits(),
        );

        let mut current_version = version;
        let outcome = engine.run_loop(&mut plan, &mut context, &mut emit, |p, c| {
            current_version = self
                .store
                .save(session_id, p, c, current_version)
                .context("persist session step")?;
            Ok(())
        })?;
        info!(session_id, ?outcome, version = current_version, "session paused");
        Ok(outcome)
    }

    fn recall_for_mission(&self, mission: &str) -> Option<String> {
        if !self.config.memory.enabled {
            return None;
        }
        match self.memory.retrieve(mission, self.config.memory.max_lessons) {
            Ok(lessons) => crate::memory::lessons_block(&lessons, self.config.memory.budget_bytes),
            Err(err) => {
                warn!(err = %err, "lesson retrieval failed for mission planning");
                None
            }
        }
    }

    fn planner_limits(&self) -> PlannerLimits {
        PlannerLimits {
            prompt_budget_bytes: self.config.prompt_budget_bytes,
            oracle_timeout: std::time::Duration::from_secs(self.config.oracle.timeout_secs),
            oracle_max_retries: self.config.oracle.max_retries,
        }
    }

    fn loop_limits(&self) -> LoopLimits {
        LoopLimits {
            max_steps: self.config.max_steps,
            tool_timeout: std::time::Duration::from_secs(self.config.tool_timeout_secs),
            prompt_budget_bytes: self.config.prompt_budget_bytes,
            approval_policy: self.config.approval_policy,
            oracle_timeout: std::time::Duration::from_secs(self.config.oracle.timeout_secs),
            oracle_max_retries: self.config.oracle.max_retries,
            replan: ReplanLimits {
                min_confidence: self.config.replan.min_confidence,
                max_replans: self.config.replan.max_replans,
                oracle_timeout: std::time::Duration::from_secs(self.config.oracle.timeout_secs),
                oracle_max_retries: self.config.oracle.max_retries,
            },
            memory_max_lessons: if self.config.memory.enabled {
                self.config.memory.max_lessons
            } else {
                0
            },
            memory_budget_bytes: self.config.memory.budget_bytes,
        }
    }
}
