//! Engine events: the observable record of what the loop did.
//!
//! Events are both streamed to a caller-supplied callback and appended to the
//! session's `events.jsonl`, so a killed process leaves a complete trace.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::context::ApprovalDecision;
use crate::replan::StrategyKind;
use crate::tools::RiskLevel;

/// One observable step of the engine, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Oracle reasoning preceding an action.
    Thought { position: u32, thought: String },
    /// The action the oracle chose.
    Action { position: u32, action: String },
    ToolResult {
        position: u32,
        tool: String,
        success: bool,
        detail: String,
    },
    /// The loop suspended on a clarification question.
    AskUser {
        position: u32,
        key: String,
        question: String,
    },
    /// The loop suspended on a gated tool call.
    ApprovalRequired {
        position: u32,
        tool: String,
        preview: String,
        risk: RiskLevel,
    },
    ApprovalDecided {
        position: u32,
        tool: String,
        decision: ApprovalDecision,
        approver: String,
    },
    /// A recovery strategy was applied to a failed task.
    Replan {
        position: u32,
        strategy: StrategyKind,
        rationale: String,
    },
    TaskCompleted { position: u32, summary: String },
    TaskFailed { position: u32, reason: String },
    /// The task left the execution graph without running (denied approval,
    /// decomposed, or mission completed early).
    TaskSkipped { position: u32, reason: String },
    /// Every task reached a terminal status.
    MissionComplete,
    Error { message: String },
}

/// Append-only JSONL event log, one file per session.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join("events.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &EngineEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", self.path.display()))?;
        Ok(())
    }

    /// Read back all events, skipping nothing: a parse failure is an error
    /// because the log is engine-written.
    pub fn read_all(&self) -> Result<Vec<EngineEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read event log {}", self.path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("parse event log line"))
            .collect()
    }
}
