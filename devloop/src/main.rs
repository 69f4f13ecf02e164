//! devloop CLI.
//!
//! Tasks live in `.devloop/tasks/`; `run` drives one through the agent loop
//! and exits with a code per outcome (see [`devloop::exit_codes`]).

use std::fs;
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use devloop::core::types::{Decision, TaskOutcome};
use devloop::engine::{ExecutionSummary, TaskExecutionEngine};
use devloop::error::EngineError;
use devloop::exit_codes;
use devloop::interaction::{GateMode, InteractionController, gate_for};
use devloop::io::config::load_config;
use devloop::io::inference::build_client;
use devloop::io::init::{InitOptions, StatePaths, init_state};
use devloop::io::repository::{FileTaskRepository, TaskRepository};
use devloop::io::session::ProcessAgentLauncher;
use devloop::task::{Granularity, OperationContext, Task};
use jsonschema::Draft;
use serde_json::Value;

const OPERATION_SCHEMA: &str = include_str!("../schemas/operation_context.schema.json");

#[derive(Parser)]
#[command(
    name = "devloop",
    version,
    about = "Drive a coding agent until a task is accepted or escalated"
)]
struct Cli {
    /// Project root containing `.devloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.devloop/` with a default config.
    Init {
        /// Rewrite the config even if the state directory exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Add a task from flags or from an operation context JSON file.
    Add(AddArgs),
    /// Run one task until it is accepted, escalated or stopped.
    Run {
        task: String,
        /// Soft iteration budget for this run.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Read operator commands from stdin while the task runs.
        #[arg(short, long)]
        interactive: bool,
    },
    /// Show a task's status, result and iteration history.
    Status {
        task: String,
        /// Print the stored task as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct AddArgs {
    /// Task id; also the file name under `.devloop/tasks/`.
    id: String,
    #[arg(long, required_unless_present = "from")]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, default_value = "atomic")]
    granularity: Granularity,
    /// Comma-separated task ids.
    #[arg(long, value_delimiter = ',')]
    depends_on: Vec<String>,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long, default_value_t = 0)]
    priority: i64,
    /// Ask the operator before accepting the result.
    #[arg(long)]
    confirm: bool,
    /// Build the task from an operation context JSON file instead.
    #[arg(long, conflicts_with_all = ["title", "description"])]
    from: Option<PathBuf>,
}

fn main() {
    devloop::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Add(args) => cmd_add(&cli.root, args),
        Command::Run {
            task,
            max_iterations,
            interactive,
        } => cmd_run(&cli.root, &task, max_iterations, interactive),
        Command::Status { task, json } => cmd_status(&cli.root, &task, json),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_state(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_add(root: &Path, args: AddArgs) -> Result<i32> {
    let paths = existing_state(root)?;
    let repository = FileTaskRepository::new(paths);
    if repository.get_task(&args.id)?.is_some() {
        bail!("task '{}' already exists", args.id);
    }

    let mut task = match &args.from {
        Some(path) => Task::from_operation(args.id.as_str(), &read_operation(path)?),
        None => {
            let title = args.title.clone().unwrap_or_default();
            let mut task = Task::new(args.id.as_str(), title, args.granularity);
            if let Some(description) = &args.description {
                task.description = description.clone();
            }
            task.priority = args.priority;
            task
        }
    };
    if !args.depends_on.is_empty() {
        task.dependencies = args.depends_on.clone();
    }
    if args.max_iterations.is_some() {
        task.iteration_budget = args.max_iterations;
    }
    task.requires_confirmation |= args.confirm;

    repository.put_task(&task)?;
    println!("added {} ({}, {})", task.id, task.granularity, task.title);
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, id: &str, max_iterations: Option<u32>, interactive: bool) -> Result<i32> {
    let paths = existing_state(root)?;
    let config = load_config(&paths.config_path)?;
    let client = build_client(&config.inference)?;
    let launcher = ProcessAgentLauncher::new(config.agent.clone());
    let timeout = Duration::from_secs(config.interaction.confirmation_timeout_secs);
    let repository = FileTaskRepository::new(paths);

    let mut engine = TaskExecutionEngine::new(config, launcher, repository, client, root)
        .map_err(anyhow::Error::from)?;
    if interactive {
        engine = engine.with_gate(gate_for(GateMode::Operator, timeout));
        spawn_operator_console(engine.controls(id));
    }

    let result = engine.execute_task_with(id, max_iterations, &|record| {
        println!(
            "iteration {}: {} (confidence {:.2}, {})",
            record.iteration,
            record.decision,
            record.confidence.score,
            record.rule.as_str()
        );
    });
    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(outcome_code(summary.outcome))
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(error_code(&err))
        }
    }
}

fn cmd_status(root: &Path, id: &str, json: bool) -> Result<i32> {
    let repository = FileTaskRepository::new(existing_state(root)?);
    let task = repository
        .get_task(id)?
        .with_context(|| format!("task '{id}' not found"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task).context("serialize task")?);
        return Ok(exit_codes::OK);
    }

    println!("{} [{}] {}", task.id, task.status, task.title);
    if !task.dependencies.is_empty() {
        println!("depends on: {}", task.dependencies.join(", "));
    }
    let m = &task.metrics;
    println!(
        "iterations: {} ({} counted, {} clarifications), agent {} ms, scoring {} ms, restarts {}",
        m.iterations,
        m.counted_iterations,
        m.clarifications,
        m.agent_ms,
        m.scoring_ms,
        m.agent_restarts
    );
    if let Some(result) = &task.result {
        println!("outcome: {}\n{}", result.outcome, result.summary);
    }
    for record in repository.iterations(id)? {
        println!(
            "  #{} {} {:.2} ({}) {} ms",
            record.iteration,
            record.decision,
            record.confidence.score,
            record.rule.as_str(),
            record.duration_ms
        );
    }
    Ok(exit_codes::OK)
}

fn existing_state(root: &Path) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if !paths.state_dir.is_dir() {
        bail!(
            "{} not found; run `devloop init` first",
            paths.state_dir.display()
        );
    }
    Ok(paths)
}

fn read_operation(path: &Path) -> Result<OperationContext> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value = serde_json::from_str(&raw).context("parse operation json")?;
    let schema: Value = serde_json::from_str(OPERATION_SCHEMA).context("parse operation schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile operation schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("operation context invalid:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("parse operation context")
}

/// One line of operator input in interactive mode.
#[derive(Debug, PartialEq)]
enum OperatorCommand {
    Pause,
    Resume,
    Stop,
    Inject(String),
    Override(Decision),
    Answer(bool),
}

fn parse_operator_command(line: &str) -> Result<OperatorCommand, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match word.to_ascii_lowercase().as_str() {
        "pause" => Ok(OperatorCommand::Pause),
        "resume" => Ok(OperatorCommand::Resume),
        "stop" => Ok(OperatorCommand::Stop),
        "approve" | "yes" => Ok(OperatorCommand::Answer(true)),
        "reject" | "no" => Ok(OperatorCommand::Answer(false)),
        "inject" if !rest.is_empty() => Ok(OperatorCommand::Inject(rest.to_string())),
        "inject" => Err("inject needs a message".to_string()),
        "override" => rest.parse().map(OperatorCommand::Override),
        other => Err(format!(
            "unknown command '{other}' (pause, resume, stop, inject <text>, override <decision>, approve, reject)"
        )),
    }
}

/// Reads operator commands from stdin until EOF. The thread is detached;
/// it dies with the process.
fn spawn_operator_console(controls: InteractionController) {
    if std::io::stdin().is_terminal() {
        eprintln!("commands: pause, resume, stop, inject <text>, override <decision>, approve, reject");
    }
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_operator_command(&line) {
                Ok(OperatorCommand::Pause) => controls.pause(),
                Ok(OperatorCommand::Resume) => controls.resume(),
                Ok(OperatorCommand::Stop) => controls.request_stop(),
                Ok(OperatorCommand::Inject(text)) => controls.inject_message(text),
                Ok(OperatorCommand::Override(decision)) => controls.override_decision(decision),
                Ok(OperatorCommand::Answer(approved)) => {
                    if !controls.answer_confirmation(approved) {
                        eprintln!("no confirmation pending");
                    }
                }
                Err(msg) => eprintln!("{msg}"),
            }
        }
    });
}

fn print_summary(summary: &ExecutionSummary) {
    println!(
        "{} {} after {} iteration(s)",
        summary.task_id, summary.outcome, summary.iterations
    );
    println!("{}", summary.summary);
}

fn outcome_code(outcome: TaskOutcome) -> i32 {
    match outcome {
        TaskOutcome::Completed => exit_codes::OK,
        TaskOutcome::SuccessWithLimits | TaskOutcome::Partial => exit_codes::PARTIAL,
        TaskOutcome::Failed => exit_codes::FAILED,
        TaskOutcome::Stopped => exit_codes::STOPPED,
        TaskOutcome::Blocked => exit_codes::BLOCKED,
    }
}

fn error_code(err: &EngineError) -> i32 {
    match err {
        EngineError::Agent { .. } => exit_codes::FATAL,
        EngineError::DependencyCycle(_) => exit_codes::BLOCKED,
        EngineError::TaskNotFound(_)
        | EngineError::AlreadyRunning(_)
        | EngineError::Config(_)
        | EngineError::Internal(_) => exit_codes::INVALID,
    }
}
