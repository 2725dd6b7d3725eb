//! Run orchestration over a file-backed event journal.
//!
//! Every command prints one JSON document on stdout. Diagnostics go to
//! stderr via `RUST_LOG`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};

use runledger::exit_codes;
use runledger::hook_exec::{ExecOutcome, ExecSettings, PlanExecutor, parse_plans};
use runledger::io::config::{config_path, load_config};
use runledger::io::hooks::CommandHookRunner;
use runledger::io::template_store::{load_playbook, resolve_template_path};
use runledger::ledger::Ledger;
use runledger::{dispatch, logging, reconcile, resume, sweep, tick};

#[derive(Parser)]
#[command(
    name = "runledger",
    version,
    about = "Run orchestration over an event-sourced repository journal"
)]
struct Cli {
    /// Repository root holding `.runledger/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Actor id stamped on written events (overrides config and RUNLEDGER_ACTOR).
    #[arg(long, global = true)]
    actor: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch, advance and inspect runs.
    #[command(subcommand)]
    Run(RunCommand),
    /// Execute plan documents.
    #[command(subcommand)]
    Hook(HookCommand),
    /// Check templates.
    #[command(subcommand)]
    Template(TemplateCommand),
}

#[derive(Subcommand)]
enum RunCommand {
    /// Start a run from a template.
    Dispatch {
        /// Template path, or a name under the templates directory.
        #[arg(long)]
        template: String,
        /// Merge patches applied in order.
        #[arg(long = "patch")]
        patches: Vec<PathBuf>,
        /// Run id (default: a fresh ULID).
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Reconcile and execute up to N transitions.
    Tick {
        run_id: String,
        #[arg(long, default_value_t = 1)]
        max_transitions: u32,
    },
    /// Settle dependencies and print the next plan.
    Reconcile {
        run_id: String,
        /// Print the full reconciliation instead of the plan envelope.
        #[arg(long)]
        json: bool,
    },
    /// Print the derived run state.
    Status { run_id: String },
    /// Convert stalled attempts into human waits.
    Sweep {
        /// Stop after this many conversions.
        #[arg(long)]
        max: Option<usize>,
        /// Idle threshold (default: exec.step_idle_timeout_secs).
        #[arg(long)]
        idle_secs: Option<u64>,
    },
    /// Release a run waiting on a human.
    ///
    /// Always appends `run.human.resumed`; on a run that is not waiting, or
    /// has finished, the record has no effect.
    Resume {
        run_id: String,
        /// Justification recorded with the resume.
        #[arg(long, default_value = "")]
        message: String,
    },
    /// Mark the current attempt completed by hand.
    CompleteStep {
        run_id: String,
        #[arg(long)]
        summary: Option<String>,
    },
}

#[derive(Subcommand)]
enum HookCommand {
    /// Execute the plans in a plan document.
    Exec {
        /// Plan document path, or `-` for stdin.
        #[arg(long)]
        plan: String,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Load, patch and validate a template; print its digest.
    Validate {
        path: String,
        #[arg(long = "patch")]
        patches: Vec<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", one_line(&err));
            std::process::exit(exit_codes::INVALID);
        }
    }
}

/// The error chain on a single line.
fn one_line(err: &anyhow::Error) -> String {
    format!("{err:#}")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(command) => cmd_run(&cli.root, cli.actor.as_deref(), command),
        Command::Hook(HookCommand::Exec { plan, dry_run }) => {
            let mut ledger = open(&cli.root, cli.actor.as_deref())?;
            cmd_hook_exec(&mut ledger, &plan, dry_run)
        }
        Command::Template(TemplateCommand::Validate { path, patches }) => {
            cmd_template_validate(&cli.root, &path, &patches)
        }
    }
}

fn open(root: &Path, actor: Option<&str>) -> Result<Ledger> {
    Ledger::open(root, actor, |key| std::env::var(key).ok())
}

fn cmd_run(root: &Path, actor: Option<&str>, command: RunCommand) -> Result<i32> {
    let mut ledger = open(root, actor)?;
    match command {
        RunCommand::Dispatch {
            template,
            patches,
            run_id,
        } => {
            let path = resolve_template_path(&ledger.root, &ledger.config.templates_dir, &template)?;
            let playbook = load_playbook(&path, &patches)?;
            let outcome =
                dispatch::dispatch_run(&mut ledger.journal, &playbook, run_id.as_deref(), None)?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        RunCommand::Tick {
            run_id,
            max_transitions,
        } => {
            let settings = ExecSettings::from_config(&ledger.root, &ledger.config);
            let runner = CommandHookRunner::new(ledger.config.hooks.clone());
            let mut executor = PlanExecutor {
                journal: &mut ledger.journal,
                runner: &runner,
                resolver: &ledger.config.hooks,
                settings: &settings,
            };
            let outcome = tick::tick(&mut executor, &run_id, max_transitions)?;
            print_json(&outcome)?;
            Ok(blocked_code(outcome.is_blocked()))
        }
        RunCommand::Reconcile { run_id, json } => {
            let rec = reconcile::reconcile(&mut ledger.journal, &ledger.config.hooks, &run_id)?;
            let blocked = rec.state.status.is_blocked();
            if json {
                print_json(&rec)?;
            } else {
                let plans: Vec<_> = rec.plan.iter().collect();
                print_json(&json!({ "plans": plans }))?;
            }
            Ok(blocked_code(blocked))
        }
        RunCommand::Status { run_id } => {
            let (_, state) = reconcile::derive_run(&ledger.journal, &run_id)?;
            print_json(&state)?;
            Ok(exit_codes::OK)
        }
        RunCommand::Sweep { max, idle_secs } => {
            let idle = Duration::from_secs(
                idle_secs.unwrap_or(ledger.config.exec.step_idle_timeout_secs),
            );
            let now = ledger.now();
            let outcome = sweep::sweep(&mut ledger.journal, now, idle, max)?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        RunCommand::Resume { run_id, message } => {
            let outcome = resume::resume(&mut ledger.journal, &run_id, &message)?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        RunCommand::CompleteStep { run_id, summary } => {
            let outcome = resume::complete_step(&mut ledger.journal, &run_id, summary.as_deref())?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_hook_exec(ledger: &mut Ledger, plan: &str, dry_run: bool) -> Result<i32> {
    let raw = if plan == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read plan from stdin")?;
        buf
    } else {
        fs::read_to_string(plan).with_context(|| format!("read plan {plan}"))?
    };
    let document: Value = serde_json::from_str(&raw).context("parse plan json")?;
    let plans = parse_plans(document)?;

    let settings = ExecSettings::from_config(&ledger.root, &ledger.config);
    let runner = CommandHookRunner::new(ledger.config.hooks.clone());
    let mut executor = PlanExecutor {
        journal: &mut ledger.journal,
        runner: &runner,
        resolver: &ledger.config.hooks,
        settings: &settings,
    };
    let reports = executor.exec_plans(&plans, dry_run)?;
    let blocked = reports.iter().any(|r| {
        matches!(
            r.outcome,
            ExecOutcome::Waiting | ExecOutcome::WaitingOnDeps
        )
    });
    print_json(&json!({ "reports": reports }))?;
    Ok(blocked_code(blocked))
}

fn cmd_template_validate(root: &Path, reference: &str, patches: &[PathBuf]) -> Result<i32> {
    let config = load_config(&config_path(root))?;
    let path = resolve_template_path(root, &config.templates_dir, reference)?;
    let playbook = load_playbook(&path, patches)?;
    print_json(&json!({
        "template_id": playbook.template.template_id,
        "version": playbook.template.version,
        "digest": playbook.digest,
        "steps": playbook.steps().iter().map(|s| &s.step_id).collect::<Vec<_>>(),
    }))?;
    Ok(exit_codes::OK)
}

fn blocked_code(blocked: bool) -> i32 {
    if blocked {
        exit_codes::BLOCKED
    } else {
        exit_codes::OK
    }
}

/// Print `value` to stdout as pretty JSON.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
