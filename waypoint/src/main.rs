//! Waypoint CLI: plan, run, and resume agent sessions from the shell.

use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use waypoint::approval::ApprovalReply;
use waypoint::config::{load_config, write_config, EngineConfig};
use waypoint::core::budget::BudgetExceededError;
use waypoint::events::EngineEvent;
use waypoint::exit_codes;
use waypoint::looping::StepOutcome;
use waypoint::memory::{JsonMemoryStore, MemoryStore, NullMemoryStore};
use waypoint::oracle::CommandOracle;
use waypoint::process::run_command_with_timeout;
use waypoint::session::SessionManager;
use waypoint::store::PlanStore;
use waypoint::tools::{RiskLevel, Tool, ToolOutcome, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Plan-execute-replan engine for tool-using agent sessions"
)]
struct Cli {
    /// Session store root directory.
    #[arg(long, default_value = ".waypoint")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `config.toml` under the store root.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Plan a new mission and run it until it suspends or finishes.
    Mission {
        #[arg(long)]
        session: String,
        /// The mission statement.
        mission: String,
    },
    /// Answer the pending clarification question and resume.
    Answer {
        #[arg(long)]
        session: String,
        answer: String,
    },
    /// Decide the pending approval (y/n/trust) and resume.
    Approve {
        #[arg(long)]
        session: String,
        reply: String,
        /// Recorded in the approval audit trail.
        #[arg(long, default_value = "cli")]
        approver: String,
    },
    /// Print the session's plan and context as JSON.
    Plan {
        #[arg(long)]
        session: String,
    },
    /// Check the stored plan's dependency structure.
    Validate {
        #[arg(long)]
        session: String,
    },
}

fn main() {
    waypoint::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Mission { session, mission } => {
            let mgr = manager(&cli.root)?;
            run_session(|emit| mgr.submit_mission(&session, &mission, emit))
        }
        Command::Answer { session, answer } => {
            let mgr = manager(&cli.root)?;
            run_session(|emit| mgr.submit_answer(&session, &answer, emit))
        }
        Command::Approve {
            session,
            reply,
            approver,
        } => {
            let reply = ApprovalReply::parse(&reply)?;
            let mgr = manager(&cli.root)?;
            run_session(|emit| mgr.submit_approval(&session, reply, &approver, emit))
        }
        Command::Plan { session } => cmd_plan(&cli.root, &session),
        Command::Validate { session } => cmd_validate(&cli.root, &session),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = root.join("config.toml");
    if path.exists() && !force {
        println!("config already exists at {}", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &EngineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_plan(root: &Path, session: &str) -> Result<i32> {
    let mgr = manager(root)?;
    let snapshot = mgr.get_plan(session)?;
    let doc = json!({
        "version": snapshot.version,
        "plan": snapshot.plan,
        "context": snapshot.context,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path, session: &str) -> Result<i32> {
    let mgr = manager(root)?;
    let problems = mgr.validate(session)?;
    if problems.is_empty() {
        println!("plan ok");
        return Ok(exit_codes::OK);
    }
    for problem in &problems {
        eprintln!("{problem}");
    }
    Ok(exit_codes::INVALID)
}

/// Drive a session operation, printing events and mapping the outcome (or a
/// consumed step budget) onto stable exit codes.
fn run_session(op: impl FnOnce(&mut dyn FnMut(&EngineEvent)) -> Result<StepOutcome>) -> Result<i32> {
    let mut emit = |event: &EngineEvent| print_event(event);
    match op(&mut emit) {
        Ok(StepOutcome::Complete) => Ok(exit_codes::COMPLETE),
        Ok(StepOutcome::Blocked { pending }) => {
            let positions = pending
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            println!("blocked: tasks [{positions}] cannot run");
            Ok(exit_codes::BLOCKED)
        }
        Ok(StepOutcome::AwaitingAnswer) => {
            println!("awaiting answer (resume with `waypoint answer`)");
            Ok(exit_codes::AWAITING_INPUT)
        }
        Ok(StepOutcome::AwaitingApproval) => {
            println!("awaiting approval (resume with `waypoint approve`)");
            Ok(exit_codes::AWAITING_INPUT)
        }
        Ok(StepOutcome::Progressed) => Ok(exit_codes::OK),
        Err(err) => {
            if let Some(budget) = err.downcast_ref::<BudgetExceededError>() {
                eprintln!("{budget}");
                return Ok(exit_codes::BLOCKED);
            }
            Err(err)
        }
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Thought { position, thought } => {
            println!("[{position}] thought: {thought}");
        }
        EngineEvent::Action { position, action } => {
            println!("[{position}] action: {action}");
        }
        EngineEvent::ToolResult {
            position,
            tool,
            success,
            detail,
        } => {
            let status = if *success { "ok" } else { "failed" };
            println!("[{position}] {tool}: {status} {detail}");
        }
        EngineEvent::AskUser {
            position, question, ..
        } => {
            println!("[{position}] question: {question}");
        }
        EngineEvent::ApprovalRequired {
            position,
            tool,
            preview,
            risk,
        } => {
            println!(
                "[{position}] approval required for {tool} (risk {}): {preview}",
                risk.as_str()
            );
        }
        EngineEvent::ApprovalDecided {
            position,
            tool,
            decision,
            approver,
        } => {
            println!("[{position}] {tool}: {decision:?} by {approver}");
        }
        EngineEvent::Replan {
            position,
            strategy,
            rationale,
        } => {
            println!("[{position}] replan {}: {rationale}", strategy.as_str());
        }
        EngineEvent::TaskCompleted { position, summary } => {
            println!("[{position}] completed: {summary}");
        }
        EngineEvent::TaskFailed { position, reason } => {
            println!("[{position}] failed: {reason}");
        }
        EngineEvent::TaskSkipped { position, reason } => {
            println!("[{position}] skipped: {reason}");
        }
        EngineEvent::MissionComplete => println!("mission complete"),
        EngineEvent::Error { message } => eprintln!("error: {message}"),
    }
}

fn manager(root: &Path) -> Result<SessionManager> {
    let config = load_config(&root.join("config.toml"))?;
    let oracle = CommandOracle::new(
        config.oracle.command.clone(),
        config.oracle.output_limit_bytes,
    );
    let memory: Arc<dyn MemoryStore> = if config.memory.enabled {
        let lessons = PathBuf::from(&config.memory.lessons_path);
        let lessons = if lessons.is_absolute() {
            lessons
        } else {
            root.join(lessons)
        };
        Arc::new(JsonMemoryStore::new(lessons))
    } else {
        Arc::new(NullMemoryStore)
    };

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ShellTool {
        output_limit_bytes: config.oracle.output_limit_bytes,
    }));

    Ok(SessionManager::new(
        PlanStore::new(root.to_path_buf()),
        config,
        Box::new(oracle),
        tools,
        memory,
    ))
}

/// Approval-gated shell command execution. The one tool the CLI ships with;
/// richer toolsets register through the library API.
struct ShellTool {
    output_limit_bytes: usize,
}

impl ShellTool {
    fn command_line(parameters: &Map<String, Value>) -> Option<String> {
        parameters
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and capture its output"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string", "description": "Command passed to sh -c"}
            }
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn approval_preview(&self, parameters: &Map<String, Value>) -> String {
        Self::command_line(parameters).unwrap_or_else(|| "<missing command>".to_string())
    }

    fn execute(&self, parameters: &Map<String, Value>, timeout: Duration) -> ToolOutcome {
        let Some(command_line) = Self::command_line(parameters) else {
            return ToolOutcome::failed(
                waypoint::tools::ErrorKind::InvalidParams,
                "missing required parameter 'command'",
            );
        };
        let mut cmd = ProcessCommand::new("sh");
        cmd.args(["-c", &command_line]);
        let output = match run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .context("run shell command")
        {
            Ok(output) => output,
            Err(err) => {
                return ToolOutcome::failed(waypoint::tools::ErrorKind::Internal, format!("{err:#}"))
            }
        };
        if output.timed_out {
            return ToolOutcome::failed(
                waypoint::tools::ErrorKind::Timeout,
                format!("command timed out after {timeout:?}"),
            );
        }
        if !output.status.success() {
            return ToolOutcome::failed(
                waypoint::tools::ErrorKind::Internal,
                format!(
                    "exit status {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            );
        }
        ToolOutcome::ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}
