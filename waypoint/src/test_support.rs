//! Deterministic test doubles: scripted oracles, static tools, plan builders.
//!
//! Available to this crate's tests and, behind the `test-support` feature, to
//! downstream integration tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use crate::core::plan::{Plan, Task};
use crate::oracle::{Oracle, OracleRequest};
use crate::tools::{ErrorKind, RiskLevel, Tool, ToolOutcome};

/// A pending task at `position` depending on `deps`.
pub fn task(position: u32, deps: &[u32]) -> Task {
    let mut t = Task::new(position, format!("task {position}"));
    t.dependencies = deps.iter().copied().collect();
    t
}

/// A plan named `plan-test` holding `tasks` as given.
pub fn plan_with_tasks(tasks: Vec<Task>) -> Plan {
    let mut plan = Plan::new("plan-test");
    plan.mission = "test mission".to_string();
    plan.tasks = tasks;
    plan
}

/// Oracle that replays a fixed script of raw JSON responses, in order.
///
/// Erroring when the script runs dry makes an unexpected extra decision a
/// loud test failure instead of a hang.
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<Value>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("script lock").len()
    }
}

impl Oracle for ScriptedOracle {
    fn decide(&self, _request: &OracleRequest, _timeout: Duration) -> Result<Value> {
        self.responses
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle exhausted"))
    }
}

/// Tool with a fixed outcome, optionally approval-gated.
pub struct StaticTool {
    name: String,
    gated: bool,
    risk: RiskLevel,
    outcome: ToolOutcome,
}

impl StaticTool {
    /// A tool whose every call succeeds.
    pub fn succeeding(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gated: false,
            risk: RiskLevel::Low,
            outcome: ToolOutcome::ok(json!({"tool": name, "ok": true})),
        }
    }

    /// A tool whose every call fails with `kind`.
    pub fn failing(name: &str, kind: ErrorKind) -> Self {
        Self {
            name: name.to_string(),
            gated: false,
            risk: RiskLevel::Low,
            outcome: ToolOutcome::failed(kind, format!("{name} failed")),
        }
    }

    /// Require approval before every call, at high risk.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self.risk = RiskLevel::High;
        self
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test tool"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn requires_approval(&self) -> bool {
        self.gated
    }

    fn risk_level(&self) -> RiskLevel {
        self.risk
    }

    fn approval_preview(&self, parameters: &Map<String, Value>) -> String {
        format!("{}({})", self.name, Value::Object(parameters.clone()))
    }

    fn execute(&self, _parameters: &Map<String, Value>, _timeout: Duration) -> ToolOutcome {
        self.outcome.clone()
    }
}

/// Tool that fails a fixed number of times before succeeding. For recovery
/// paths that retry the same tool.
pub struct FlakyTool {
    name: String,
    failures: Mutex<u32>,
    kind: ErrorKind,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32, kind: ErrorKind) -> Self {
        Self {
            name: name.to_string(),
            failures: Mutex::new(failures),
            kind,
        }
    }
}

impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "flaky test tool"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn requires_approval(&self) -> bool {
        false
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    fn approval_preview(&self, _parameters: &Map<String, Value>) -> String {
        self.name.clone()
    }

    fn execute(&self, _parameters: &Map<String, Value>, _timeout: Duration) -> ToolOutcome {
        let mut remaining = self.failures.lock().expect("failure counter");
        if *remaining > 0 {
            *remaining -= 1;
            ToolOutcome::failed(self.kind, format!("{} transient failure", self.name))
        } else {
            ToolOutcome::ok(json!({"tool": self.name, "ok": true}))
        }
    }
}
