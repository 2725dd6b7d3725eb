//! CLI tests for runledger exit codes.
//!
//! Spawns the runledger binary against a temp repository and verifies that
//! blocked runs, hard errors and successful commands map to the documented
//! exit codes, and that stdout stays empty on failure.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use runledger::exit_codes;
use runledger::io::config::{EngineConfig, config_path, write_config};
use serde_json::{Value, json};

fn runledger(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runledger"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("RUNLEDGER_ACTOR")
        .env_remove("RUNLEDGER_NOW")
        .output()
        .expect("spawn runledger")
}

fn write_template(root: &Path, name: &str, document: &Value) {
    let path = root.join(name);
    fs::write(&path, serde_json::to_vec_pretty(document).expect("json")).expect("write template");
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

fn review_template() -> Value {
    json!({
        "template_id": "review-first",
        "version": 1,
        "steps": [
            {"step_id": "review", "type": "human", "breakpoint": {"enabled": true}},
            {"step_id": "ship", "type": "human"}
        ]
    })
}

#[test]
fn template_validate_reports_digest() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(temp.path(), "review.json", &review_template());

    let output = runledger(temp.path(), &["template", "validate", "review.json"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["template_id"], "review-first");
    assert_eq!(report["digest"].as_str().map(str::len), Some(64));
}

#[test]
fn invalid_template_exits_invalid_with_empty_stdout() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(
        temp.path(),
        "broken.json",
        &json!({"template_id": "broken", "version": 1, "steps": []}),
    );

    let output = runledger(temp.path(), &["template", "validate", "broken.json"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());
}

#[test]
fn template_problems_print_as_one_stderr_line() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(
        temp.path(),
        "broken.json",
        &json!({
            "template_id": "broken",
            "version": 1,
            "steps": [
                {"step_id": "a", "type": "agent"},
                {"step_id": "a", "type": "agent"},
                {"step_id": "b", "type": "reward", "reward": {"signals": ["ghost"]}}
            ]
        }),
    );

    let output = runledger(temp.path(), &["template", "validate", "broken.json"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.trim_end().lines().count(), 1, "stderr: {stderr}");
    assert!(stderr.contains("broken.json"));
}

#[test]
fn unknown_run_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = runledger(temp.path(), &["run", "status", "missing"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(output.stdout.is_empty());
}

#[test]
fn breakpoint_blocks_until_resumed() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(temp.path(), "review.json", &review_template());

    let output = runledger(
        temp.path(),
        &["run", "dispatch", "--template", "review.json", "--run-id", "run-1"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["run_id"], "run-1");

    let output = runledger(temp.path(), &["run", "tick", "run-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert_eq!(stdout_json(&output)["status"], "WAIT_HUMAN");

    let output = runledger(temp.path(), &["run", "reconcile", "run-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert_eq!(stdout_json(&output)["plans"][0]["kind"], "WAIT_HUMAN");

    let output = runledger(temp.path(), &["run", "resume", "run-1", "--message", "approved"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["was_waiting"], true);

    let output = runledger(
        temp.path(),
        &["run", "complete-step", "run-1", "--summary", "reviewed by hand"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["step_id"], "review");

    let output = runledger(temp.path(), &["run", "status", "run-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["current"]["step_id"], "ship");
}

#[test]
fn resume_without_message_is_still_recorded() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(temp.path(), "review.json", &review_template());
    runledger(
        temp.path(),
        &["run", "dispatch", "--template", "review.json", "--run-id", "run-1"],
    );
    let output = runledger(temp.path(), &["run", "tick", "run-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));

    let output = runledger(temp.path(), &["run", "resume", "run-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["was_waiting"], true);
    assert_eq!(outcome["status"], "ACTIVE");
}

#[cfg(unix)]
#[test]
fn tick_runs_hook_commands_to_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.hooks.commands.insert(
        "agent".to_string(),
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat >/dev/null; echo '{\"ok\": true, \"summary\": \"done\"}'".to_string(),
        ],
    );
    write_config(&config_path(temp.path()), &config).expect("write config");
    write_template(
        temp.path(),
        "pair.json",
        &json!({
            "template_id": "pair",
            "version": 1,
            "steps": [
                {"step_id": "design", "type": "agent"},
                {"step_id": "build", "type": "agent"}
            ]
        }),
    );

    let output = runledger(
        temp.path(),
        &["run", "dispatch", "--template", "pair.json", "--run-id", "run-1"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let output = runledger(temp.path(), &["run", "tick", "run-1", "--max-transitions", "5"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "DONE");
    assert_eq!(outcome["stop"], "terminal");

    let log = temp
        .path()
        .join(".runledger/artifacts/run-1/design/1/agent.log");
    assert!(log.exists());
}

#[test]
fn hook_exec_dry_run_reads_plan_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_template(temp.path(), "review.json", &review_template());
    runledger(
        temp.path(),
        &["run", "dispatch", "--template", "review.json", "--run-id", "run-1"],
    );
    let output = runledger(temp.path(), &["run", "reconcile", "run-1"]);
    fs::write(temp.path().join("plan.json"), &output.stdout).expect("write plan");

    let output = runledger(temp.path(), &["hook", "exec", "--plan", "plan.json", "--dry-run"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let reports = stdout_json(&output);
    assert_eq!(reports["reports"][0]["outcome"], "dry_run");
    assert_eq!(reports["reports"][0]["events"][0], "run.human.waiting");
}
