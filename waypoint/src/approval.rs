//! Approval gate for side-effecting tool calls.
//!
//! Check order: ungated tools pass silently, then session trust, then the
//! per-tool approval cache, then the configured policy. Only the last step can
//! suspend the loop on a human. Interactive approvals and denials are
//! one-shot; a standing grant comes only from "trust" (session-wide) or a
//! pre-seeded cache entry. Every decision that was actually gated lands in
//! the append-only audit history.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::debug;

use anyhow::{anyhow, Result};

use crate::core::context::{
    ApprovalDecision, ApprovalRecord, PendingApproval, SessionContext,
};
use crate::tools::Tool;

/// What the gate does when no cached or trusted decision applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Suspend and wait for a human decision.
    Prompt,
    /// Approve unattended. For trusted environments and tests.
    AutoApprove,
    /// Deny unattended. The task is skipped, not failed.
    AutoDeny,
}

/// Outcome of gating one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Call may proceed. `approver` is `None` when the tool was never gated.
    Allowed { approver: Option<String> },
    Denied { approver: String },
    /// A human must decide; the pending call is persisted in the context.
    Suspended,
}

/// Gate a tool call, recording the decision when one is made.
pub fn check(
    tool: &dyn Tool,
    parameters: &Map<String, serde_json::Value>,
    position: u32,
    context: &mut SessionContext,
    policy: ApprovalPolicy,
) -> GateOutcome {
    if !tool.requires_approval() {
        return GateOutcome::Allowed { approver: None };
    }

    if context.trust_mode {
        let approver = "trust".to_string();
        record(context, tool, position, ApprovalDecision::Approved, &approver);
        return GateOutcome::Allowed {
            approver: Some(approver),
        };
    }

    // Only a positive cache entry decides; anything else falls through to
    // the policy.
    if context.approval_cache.get(tool.name()).copied().unwrap_or(false) {
        let approver = "cache".to_string();
        record(context, tool, position, ApprovalDecision::Approved, &approver);
        return GateOutcome::Allowed {
            approver: Some(approver),
        };
    }

    match policy {
        ApprovalPolicy::AutoApprove => {
            let approver = "policy:auto_approve".to_string();
            record(context, tool, position, ApprovalDecision::Approved, &approver);
            GateOutcome::Allowed {
                approver: Some(approver),
            }
        }
        ApprovalPolicy::AutoDeny => {
            let approver = "policy:auto_deny".to_string();
            record(context, tool, position, ApprovalDecision::Denied, &approver);
            GateOutcome::Denied { approver }
        }
        ApprovalPolicy::Prompt => {
            debug!(tool = tool.name(), position, "suspending on approval");
            context.pending_approval = Some(PendingApproval {
                position,
                tool: tool.name().to_string(),
                parameters: parameters.clone(),
                preview: tool.approval_preview(parameters),
                risk: tool.risk_level(),
                decision: None,
            });
            GateOutcome::Suspended
        }
    }
}

/// A human reply to a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalReply {
    Approve,
    Deny,
    /// Approve and auto-pass every later check this session.
    Trust,
}

impl ApprovalReply {
    /// Parse the replies accepted on the CLI.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "approve" => Ok(ApprovalReply::Approve),
            "n" | "no" | "deny" => Ok(ApprovalReply::Deny),
            "trust" => Ok(ApprovalReply::Trust),
            other => Err(anyhow!("unrecognized approval reply '{other}' (y/n/trust)")),
        }
    }
}

/// Resolve the pending approval with a human reply.
///
/// Sets the decision for the loop to consume on resume and audits it. Plain
/// approvals and denials are one-shot: the next gated call prompts again.
/// Only "trust" installs a standing session-wide grant. Errors when nothing
/// is pending or the pending call was already decided.
pub fn resolve(context: &mut SessionContext, reply: ApprovalReply, approver: &str) -> Result<()> {
    let pending = context
        .pending_approval
        .as_mut()
        .ok_or_else(|| anyhow!("no approval is pending"))?;
    if pending.decision.is_some() {
        return Err(anyhow!("pending approval was already decided"));
    }

    let decision = match reply {
        ApprovalReply::Approve | ApprovalReply::Trust => ApprovalDecision::Approved,
        ApprovalReply::Deny => ApprovalDecision::Denied,
    };
    pending.decision = Some(decision);

    let tool = pending.tool.clone();
    let position = pending.position;
    let risk = pending.risk;

    if reply == ApprovalReply::Trust {
        context.trust_mode = true;
    }

    context.approval_history.push(ApprovalRecord {
        tool,
        position,
        risk,
        decision,
        at: Utc::now(),
        approver: approver.to_string(),
    });
    Ok(())
}

fn record(
    context: &mut SessionContext,
    tool: &dyn Tool,
    position: u32,
    decision: ApprovalDecision,
    approver: &str,
) {
    context.approval_history.push(ApprovalRecord {
        tool: tool.name().to_string(),
        position,
        risk: tool.risk_level(),
        decision,
        at: Utc::now(),
        approver: approver.to_string(),
    });
}
