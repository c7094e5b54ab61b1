//! Tool capability contract and registry.
//!
//! The engine never implements tools; it only calls this contract. Concrete
//! tools (shell, file I/O, git, web fetch, search) live outside the core and
//! register here. Tests use scripted tools from [`crate::test_support`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Risk classification a tool declares for its side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Normalized failure classification for tool and oracle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    InvalidParams,
    NotFound,
    PermissionDenied,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Result of one tool execution. Failures here are normal observations, not
/// engine errors; the replanner decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    /// Payload on success.
    #[serde(default)]
    pub data: Option<Value>,
    /// Normalized error message on failure.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }
}

/// Declarative description of a tool, handed to the oracle as part of its
/// context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
}

/// A capability the execution loop can dispatch to.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the accepted parameters.
    fn parameters_schema(&self) -> Value;
    /// Whether calls must pass the approval gate first.
    fn requires_approval(&self) -> bool;
    fn risk_level(&self) -> RiskLevel;
    /// Human-readable preview of what this call would do, shown when asking
    /// for approval.
    fn approval_preview(&self, parameters: &Map<String, Value>) -> String;
    /// Execute the call within `timeout`. A timeout or failure is reported
    /// through [`ToolOutcome`], not as an `Err`.
    fn execute(&self, parameters: &Map<String, Value>, timeout: Duration) -> ToolOutcome;
}

/// Lookup table of available tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(Box::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for every registered tool, in name order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
                requires_approval: tool.requires_approval(),
                risk_level: tool.risk_level(),
            })
            .collect()
    }
}
