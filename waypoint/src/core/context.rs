//! Per-session state: answers, suspensions, approval audit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::core::plan::Observation;
use crate::tools::{ErrorKind, RiskLevel};

/// A clarification question the engine is suspended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Key under which the answer is merged into [`SessionContext::answers`].
    pub key: String,
    pub question: String,
    /// Position of the task that asked.
    pub position: u32,
}

/// Outcome of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// A gated tool call the engine is suspended on.
///
/// The deferred call is persisted in full so the process can be killed and
/// resumed from the store without losing the pending action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub position: u32,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, serde_json::Value>,
    pub preview: String,
    pub risk: RiskLevel,
    /// Set by `submit_approval`; the execution loop consumes it on resume.
    #[serde(default)]
    pub decision: Option<ApprovalDecision>,
}

/// One immutable audit entry for an approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub tool: String,
    pub position: u32,
    pub risk: RiskLevel,
    pub decision: ApprovalDecision,
    pub at: DateTime<Utc>,
    /// Human identity, or `policy:<name>` for policy-driven decisions.
    pub approver: String,
}

/// Per-conversation state persisted alongside the plan.
///
/// Owned by exactly one session; never shared across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    /// Answers to clarification questions, keyed by question key.
    pub answers: BTreeMap<String, String>,
    pub pending_question: Option<PendingQuestion>,
    pub pending_approval: Option<PendingApproval>,
    /// Session-scoped tool approvals (`trust` grants bypass this entirely).
    pub approval_cache: BTreeMap<String, bool>,
    /// When set, all approval checks auto-pass for the rest of the session.
    pub trust_mode: bool,
    /// Append-only audit log of approval decisions.
    pub approval_history: Vec<ApprovalRecord>,
    /// Steps consumed against the global step budget. Survives restarts.
    pub steps_taken: u32,
}

impl SessionContext {
    /// True when the loop is suspended waiting on external input.
    pub fn is_suspended(&self) -> bool {
        self.pending_question.is_some()
            || self
                .pending_approval
                .as_ref()
                .is_some_and(|p| p.decision.is_none())
    }
}

/// Ephemeral context handed to the replanner when a task fails.
///
/// Not persisted on its own; the pieces that matter land in the task's
/// observation history.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub tool_name: Option<String>,
    pub parameters: Map<String, serde_json::Value>,
    pub error_message: String,
    pub error_kind: ErrorKind,
    /// Attempts so far, counting the failure that produced this context.
    pub attempt_count: u32,
    pub recent_observations: Vec<Observation>,
}

impl FailureContext {
    /// Normalized one-paragraph summary for the oracle. Never includes raw
    /// stack traces or runner internals.
    pub fn summary(&self) -> String {
        let tool = self.tool_name.as_deref().unwrap_or("<none>");
        let mut buf = format!(
            "tool: {tool}\nerror_kind: {}\nerror: {}\nattempts: {}\n",
            self.error_kind.as_str(),
            self.error_message,
            self.attempt_count
        );
        if !self.parameters.is_empty() {
            let params = serde_json::Value::Object(self.parameters.clone());
            buf.push_str(&format!("parameters: {params}\n"));
        }
        if !self.recent_observations.is_empty() {
            buf.push_str("recent observations:\n");
            for obs in &self.recent_observations {
                buf.push_str(&format!("- [{}] {}\n", obs.kind, obs.detail));
            }
        }
        buf
    }
}
