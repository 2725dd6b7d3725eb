//! Hook runner abstraction.
//!
//! Hooks are external programs: the engine writes one JSON document to their
//! stdin and reads one JSON document back from stdout. The [`HookRunner`]
//! trait keeps orchestration independent of how the program is started;
//! tests use scripted runners that never spawn anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::config::HooksConfig;
use crate::io::process::{CommandOutput, run_command_with_heartbeat};

/// One hook invocation.
#[derive(Debug, Clone)]
pub struct HookRequest {
    /// Hook name; resolved to a command line by the runner.
    pub hook: String,
    /// Document written to the hook's stdin.
    pub input: Value,
    /// Working directory (the repository root).
    pub workdir: PathBuf,
    /// Per-attempt directory for logs and hook-written files.
    pub artifact_dir: PathBuf,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub output_limit_bytes: usize,
}

/// What came back from a hook process.
#[derive(Debug, Clone, PartialEq)]
pub struct HookResponse {
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl HookResponse {
    /// The JSON document the hook printed, if any.
    ///
    /// Hooks may log to stdout before the document, so when the whole output
    /// is not JSON the last non-empty line is tried.
    pub fn document(&self) -> Option<Value> {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
        trimmed
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
    }
}

/// Abstraction over hook execution backends.
pub trait HookRunner {
    /// Run a hook to completion, calling `on_heartbeat` periodically while it runs.
    fn run(
        &self,
        request: &HookRequest,
        on_heartbeat: &mut dyn FnMut() -> Result<()>,
    ) -> Result<HookResponse>;
}

/// Runs hooks as subprocesses using the configured command table.
#[derive(Debug, Clone)]
pub struct CommandHookRunner {
    hooks: HooksConfig,
}

impl CommandHookRunner {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }
}

impl HookRunner for CommandHookRunner {
    #[instrument(skip_all, fields(hook = %request.hook, timeout_secs = request.timeout.as_secs()))]
    fn run(
        &self,
        request: &HookRequest,
        on_heartbeat: &mut dyn FnMut() -> Result<()>,
    ) -> Result<HookResponse> {
        let argv = self.hooks.command_for(&request.hook)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("hook '{}' has an empty command", request.hook))?;
        info!(program = %program, "starting hook");

        fs::create_dir_all(&request.artifact_dir).with_context(|| {
            format!("create artifact dir {}", request.artifact_dir.display())
        })?;
        let mut input = serde_json::to_vec_pretty(&request.input).context("serialize hook input")?;
        input.push(b'\n');

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("RUNLEDGER_HOOK", &request.hook)
            .env("RUNLEDGER_ARTIFACT_DIR", &request.artifact_dir);

        let output = run_command_with_heartbeat(
            cmd,
            Some(&input),
            request.timeout,
            request.output_limit_bytes,
            request.heartbeat_interval,
            on_heartbeat,
        )
        .with_context(|| format!("run hook '{}' ({program})", request.hook))?;

        let log_path = request.artifact_dir.join(format!("{}.log", request.hook));
        write_hook_log(&log_path, &output, &request.hook)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "hook timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "hook exited non-zero");
        } else {
            debug!(heartbeats = output.heartbeats, "hook completed");
        }

        Ok(HookResponse {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

fn write_hook_log(path: &Path, output: &CommandOutput, hook: &str) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice(hook));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice(hook));
    if output.timed_out {
        buf.push_str("\n[hook timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write hook log {}", path.display()))
}
