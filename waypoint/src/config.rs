//! Engine configuration stored under `<root>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalPolicy;
use crate::prompt::DEFAULT_PROMPT_BUDGET_BYTES;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on loop steps across the whole session, restarts included.
    pub max_steps: u32,

    /// Per-tool-call wall-clock budget in seconds.
    pub tool_timeout_secs: u64,

    /// Rendered prompt byte budget.
    pub prompt_budget_bytes: usize,

    pub approval_policy: ApprovalPolicy,

    pub oracle: OracleConfig,
    pub replan: ReplanConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command invoked per decision; the request arrives on stdin as JSON.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Extra attempts after a malformed or failed response.
    pub max_retries: u32,
    /// Truncate oracle stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["waypoint-oracle".to_string()],
            timeout_secs: 60,
            max_retries: 2,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplanConfig {
    /// Strategies below this confidence are discarded.
    pub min_confidence: f64,
    /// Structural edits allowed per task before it fails terminally.
    pub max_replans: u32,
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_replans: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Lessons file, relative to the store root when not absolute.
    pub lessons_path: String,
    pub max_lessons: usize,
    /// Byte budget for the lessons prompt section.
    pub budget_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lessons_path: "lessons.jsonl".to_string(),
            max_lessons: 5,
            budget_bytes: 2_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            tool_timeout_secs: 120,
            prompt_budget_bytes: DEFAULT_PROMPT_BUDGET_BYTES,
            approval_policy: ApprovalPolicy::Prompt,
            oracle: OracleConfig::default(),
            replan: ReplanConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.replan.min_confidence) {
            return Err(anyhow!("replan.min_confidence must be within 0.0..=1.0"));
        }
        if self.memory.enabled && self.memory.lessons_path.trim().is_empty() {
            return Err(anyhow!("memory.lessons_path must be set when enabled"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
