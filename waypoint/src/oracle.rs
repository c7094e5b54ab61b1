//! Reasoning Oracle contract: request shape, decision parsing, and a
//! subprocess adapter.
//!
//! The oracle is an external, non-deterministic decision source. Every
//! response is schema-validated before it is trusted; malformed output is a
//! retryable error with a bounded retry count, after which the caller
//! treats the decision as failed. Call sites must handle that branch
//! explicitly; well-formed output is never assumed.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::process::run_command_with_timeout;
use crate::replan::ReplanStrategy;
use crate::tools::ToolSchema;

const ACTION_SCHEMA: &str = include_str!("../schemas/decision_action.schema.json");
const PLAN_SCHEMA: &str = include_str!("../schemas/decision_plan.schema.json");
const RECOVERY_SCHEMA: &str = include_str!("../schemas/decision_recovery.schema.json");

/// Speaker tag on a request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message in the oracle request history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Which decision form the engine expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Action,
    Plan,
    Recovery,
}

impl DecisionKind {
    fn schema(self) -> &'static str {
        match self {
            DecisionKind::Action => ACTION_SCHEMA,
            DecisionKind::Plan => PLAN_SCHEMA,
            DecisionKind::Recovery => RECOVERY_SCHEMA,
        }
    }
}

/// Structured context handed to the oracle.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub messages: Vec<Message>,
    pub tool_schemas: Vec<ToolSchema>,
    /// Advisory lessons block, already truncated to budget.
    pub memory_context: Option<String>,
    pub expects: DecisionKind,
}

/// The single next action for a task. Closed set; the execution loop matches
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ToolCall {
        tool: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    AskUser {
        key: String,
        question: String,
    },
    Complete {
        #[serde(default)]
        summary: String,
    },
    UpdatePlan {
        notes: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ToolCall { .. } => "tool_call",
            Action::AskUser { .. } => "ask_user",
            Action::Complete { .. } => "complete",
            Action::UpdatePlan { .. } => "update_plan",
        }
    }
}

/// Thought plus exactly one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtAction {
    pub thought: String,
    pub action: Action,
}

/// One task in a generated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Positions of earlier tasks in the same response this one depends on.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub acceptance_criteria: String,
}

impl TaskSpec {
    pub fn described(description: &str) -> Self {
        Self {
            description: description.to_string(),
            tool_name: None,
            parameters: Map::new(),
            dependencies: Vec::new(),
            acceptance_criteria: String::new(),
        }
    }
}

/// A generated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub notes: String,
}

/// Parsed, validated oracle decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Action(ThoughtAction),
    Plan(PlanResponse),
    Recovery(ReplanStrategy),
}

/// The oracle exhausted its retries without producing a well-formed
/// decision. Callers treat this as a failed decision, not a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleProtocolError {
    pub attempts: u32,
    pub reason: String,
}

impl fmt::Display for OracleProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oracle produced no valid decision after {} attempts: {}",
            self.attempts, self.reason
        )
    }
}

impl std::error::Error for OracleProtocolError {}

/// Abstraction over the external reasoning service.
///
/// Implementations return raw JSON; validation and parsing happen in
/// [`request_decision`] so every backend is held to the same contract.
pub trait Oracle {
    fn decide(&self, request: &OracleRequest, timeout: Duration) -> Result<Value>;
}

/// Ask the oracle for a decision, validating against the expected schema.
///
/// Transport failures and malformed responses both count against the retry
/// budget; after `1 + max_retries` attempts the typed
/// [`OracleProtocolError`] is returned.
#[instrument(skip_all, fields(expects = ?request.expects))]
pub fn request_decision<O: Oracle + ?Sized>(
    oracle: &O,
    request: &OracleRequest,
    timeout: Duration,
    max_retries: u32,
) -> Result<Decision> {
    let attempts = 1 + max_retries;
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        let value = match oracle.decide(request, timeout) {
            Ok(value) => value,
            Err(err) => {
                warn!(attempt, err = %err, "oracle call failed");
                last_reason = err.to_string();
                continue;
            }
        };
        match parse_decision(request.expects, &value) {
            Ok(decision) => {
                debug!(attempt, "oracle decision accepted");
                return Ok(decision);
            }
            Err(err) => {
                warn!(attempt, err = %err, "oracle response malformed");
                last_reason = err.to_string();
            }
        }
    }
    Err(anyhow!(OracleProtocolError {
        attempts,
        reason: last_reason,
    }))
}

/// Validate `value` against the schema for `expects` and parse it.
pub fn parse_decision(expects: DecisionKind, value: &Value) -> Result<Decision> {
    validate_schema(expects.schema(), value)?;
    let decision = match expects {
        DecisionKind::Action => Decision::Action(
            serde_json::from_value(value.clone()).context("deserialize thought+action")?,
        ),
        DecisionKind::Plan => Decision::Plan(
            serde_json::from_value(value.clone()).context("deserialize plan response")?,
        ),
        DecisionKind::Recovery => Decision::Recovery(
            serde_json::from_value(value.clone()).context("deserialize recovery strategy")?,
        ),
    };
    Ok(decision)
}

fn validate_schema(schema_raw: &str, value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse decision schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "decision schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Oracle backed by a subprocess: the request is piped to stdin as JSON and
/// the decision is read from stdout as JSON.
pub struct CommandOracle {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
    fn decide(&self, request: &OracleRequest, timeout: Duration) -> Result<Value> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);

        let input = serde_json::to_vec(request).context("serialize oracle request")?;
        let output =
            run_command_with_timeout(cmd, Some(&input), timeout, self.output_limit_bytes)
                .context("run oracle command")?;

        if output.timed_out {
            return Err(anyhow!("oracle timed out after {:?}", timeout));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "oracle command failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        serde_json::from_slice(&output.stdout).context("parse oracle stdout as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct ScriptedValues {
        values: RefCell<Vec<Result<Value>>>,
    }

    impl Oracle for ScriptedValues {
        fn decide(&self, _request: &OracleRequest, _timeout: Duration) -> Result<Value> {
            self.values.borrow_mut().remove(0)
        }
    }

    fn action_request() -> OracleRequest {
        OracleRequest {
            messages: vec![Message {
                role: Role::User,
                content: "do the thing".to_string(),
            }],
            tool_schemas: Vec::new(),
            memory_context: None,
            expects: DecisionKind::Action,
        }
    }

    /// A malformed first response is retried and the valid second response
    /// is accepted.
    #[test]
    fn malformed_response_is_retried() {
        let oracle = ScriptedValues {
            values: RefCell::new(vec![
                Ok(json!({"not": "a decision"})),
                Ok(json!({
                    "thought": "run the build",
                    "action": {"type": "tool_call", "tool": "shell", "parameters": {}}
                })),
            ]),
        };

        let decision =
            request_decision(&oracle, &action_request(), Duration::from_secs(1), 1).expect("ok");
        match decision {
            Decision::Action(ta) => assert_eq!(ta.action.name(), "tool_call"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    /// Exhausted retries yield a downcastable OracleProtocolError.
    #[test]
    fn exhausted_retries_yield_protocol_error() {
        let oracle = ScriptedValues {
            values: RefCell::new(vec![
                Ok(json!({"garbage": true})),
                Ok(json!({"garbage": true})),
            ]),
        };

        let err = request_decision(&oracle, &action_request(), Duration::from_secs(1), 1)
            .expect_err("must fail");
        let protocol = err
            .downcast_ref::<OracleProtocolError>()
            .expect("typed error");
        assert_eq!(protocol.attempts, 2);
    }

    #[test]
    fn parses_each_action_variant() {
        for (value, name) in [
            (
                json!({"thought": "t", "action": {"type": "tool_call", "tool": "x"}}),
                "tool_call",
            ),
            (
                json!({"thought": "t", "action": {"type": "ask_user", "key": "k", "question": "q"}}),
                "ask_user",
            ),
            (
                json!({"thought": "t", "action": {"type": "complete", "summary": "done"}}),
                "complete",
            ),
            (
                json!({"thought": "t", "action": {"type": "update_plan", "notes": "n"}}),
                "update_plan",
            ),
        ] {
            let decision = parse_decision(DecisionKind::Action, &value).expect("parse");
            let Decision::Action(ta) = decision else {
                panic!("expected action");
            };
            assert_eq!(ta.action.name(), name);
        }
    }

    #[test]
    fn parses_plan_response() {
        let value = json!({
            "tasks": [
                {"description": "clone the repo", "tool_name": "git", "dependencies": []},
                {"description": "run tests", "dependencies": [0]}
            ],
            "notes": "two-phase"
        });
        let Decision::Plan(plan) = parse_decision(DecisionKind::Plan, &value).expect("parse")
        else {
            panic!("expected plan");
        };
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].dependencies, vec![0]);
    }

    #[test]
    fn recovery_schema_rejects_missing_confidence() {
        let value = json!({
            "strategy": "retry_with_params",
            "parameters": {},
            "rationale": "try again"
        });
        assert!(parse_decision(DecisionKind::Recovery, &value).is_err());
    }
}
