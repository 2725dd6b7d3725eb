//! Test-only helpers: a throwaway ledger, canned templates and a scripted hook runner.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::event::{Event, RunEvent};
use crate::core::state::RunState;
use crate::core::template::Playbook;
use crate::dispatch::dispatch_run;
use crate::hook_exec::{ExecSettings, PlanExecutor};
use crate::io::clock::HlcClock;
use crate::io::config::EngineConfig;
use crate::io::hooks::{HookRequest, HookResponse, HookRunner};
use crate::io::journal::{FsJournal, Journal};
use crate::reconcile::derive_run;

/// A ledger rooted in a temp dir that lives as long as the value.
pub struct TestLedger {
    pub temp: TempDir,
    pub root: PathBuf,
    pub journal: FsJournal,
    pub config: EngineConfig,
}

impl TestLedger {
    /// Ledger on the wall clock.
    pub fn new() -> TestLedger {
        TestLedger::with_config(EngineConfig {
            actor: "tester".to_string(),
            ..EngineConfig::default()
        })
    }

    /// Ledger whose clock is pinned to `now` (RFC3339).
    pub fn at(now: &str) -> TestLedger {
        TestLedger::with_config(EngineConfig {
            actor: "tester".to_string(),
            now: Some(now.to_string()),
            ..EngineConfig::default()
        })
    }

    pub fn with_config(config: EngineConfig) -> TestLedger {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let fixed_now = config.now.as_deref().map(|now| {
            DateTime::parse_from_rfc3339(now)
                .expect("fixed now")
                .with_timezone(&Utc)
        });
        let clock = HlcClock::open(&root, &config.actor, fixed_now).expect("clock");
        let journal = FsJournal::new(&root, &config.actor, clock).expect("journal");
        TestLedger {
            temp,
            root,
            journal,
            config,
        }
    }

    pub fn dispatch(&mut self, playbook: &Playbook, run_id: &str) {
        dispatch_run(&mut self.journal, playbook, Some(run_id), None).expect("dispatch");
    }

    pub fn append(&mut self, run_id: &str, event: RunEvent) {
        self.journal.append(run_id, &event).expect("append");
    }

    pub fn events(&self, run_id: &str) -> Vec<Event> {
        self.journal.read(run_id).expect("read")
    }

    pub fn kinds(&self, run_id: &str) -> Vec<String> {
        self.events(run_id).into_iter().map(|e| e.kind).collect()
    }

    pub fn state(&self, run_id: &str) -> RunState {
        derive_run(&self.journal, run_id).expect("derive").1
    }

    pub fn settings(&self) -> ExecSettings {
        ExecSettings::from_config(&self.root, &self.config)
    }

    /// Executor over this ledger, resolving hooks from its config.
    pub fn executor<'a>(
        &'a mut self,
        runner: &'a dyn HookRunner,
        settings: &'a ExecSettings,
    ) -> PlanExecutor<'a> {
        PlanExecutor {
            journal: &mut self.journal,
            runner,
            resolver: &self.config.hooks,
            settings,
        }
    }
}

impl Default for TestLedger {
    fn default() -> Self {
        TestLedger::new()
    }
}

fn playbook(document: Value) -> Playbook {
    Playbook::from_value(document).expect("valid template")
}

/// `design` then `build`, both agent steps.
pub fn two_agent_template() -> Playbook {
    playbook(json!({
        "template_id": "two-agent",
        "version": 1,
        "steps": [
            {"step_id": "design", "type": "agent", "instructions": "Design {{ run_id }}"},
            {"step_id": "build", "type": "agent"}
        ]
    }))
}

/// `design`, a human `review` behind a breakpoint, then `ship`.
pub fn breakpoint_template() -> Playbook {
    playbook(json!({
        "template_id": "reviewed",
        "version": 1,
        "steps": [
            {"step_id": "design", "type": "agent"},
            {
                "step_id": "review",
                "type": "human",
                "breakpoint": {"enabled": true, "message": "approve the design"}
            },
            {"step_id": "ship", "type": "agent"}
        ]
    }))
}

/// `implement` graded by `grade`, which redoes `implement` on a low score.
///
/// The `tests` signal is HARD and produced by the `run-tests` hook.
pub fn reward_redo_template() -> Playbook {
    playbook(json!({
        "template_id": "graded",
        "version": 1,
        "steps": [
            {"step_id": "implement", "type": "agent"},
            {
                "step_id": "grade",
                "type": "reward",
                "reward": {
                    "signals": ["tests", "lint"],
                    "policy": {
                        "on_fail": "auto_redo",
                        "redo_target_step_id": "implement",
                        "max_attempts": 3
                    },
                    "thresholds": {"pass": 0.8}
                }
            }
        ],
        "signals": {
            "tests": {"weight": 3, "severity": "HARD"},
            "lint": {"weight": 1, "severity": "SOFT"}
        },
        "evidence_producers": {"tests": {"hook": "run-tests", "args": {"suite": "unit"}}}
    }))
}

/// `fan-out` may spawn children and waits for all of them before `merge`.
pub fn spawn_template() -> Playbook {
    playbook(json!({
        "template_id": "fan-out",
        "version": 1,
        "steps": [
            {
                "step_id": "fan-out",
                "type": "agent",
                "dependencies": {"allow_spawn": true, "await": "all"}
            },
            {"step_id": "merge", "type": "agent"}
        ]
    }))
}

/// Output document of a successful hook.
pub fn ok_output(summary: &str) -> Value {
    json!({"ok": true, "summary": summary})
}

struct Scripted {
    response: HookResponse,
    heartbeats: u32,
}

/// Hook runner that replays queued responses per hook name.
///
/// Every request is recorded; a hook without a queued response is an error.
#[derive(Default)]
pub struct ScriptedHookRunner {
    queue: RefCell<BTreeMap<String, VecDeque<Scripted>>>,
    calls: RefCell<Vec<HookRequest>>,
}

impl ScriptedHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a document printed by a hook that exits 0.
    pub fn reply(self, hook: &str, document: Value) -> Self {
        self.respond(
            hook,
            HookResponse {
                stdout: format!("{document}\n"),
                exit_code: Some(0),
                timed_out: false,
            },
            0,
        )
    }

    /// Queue a raw response, firing `heartbeats` heartbeats first.
    pub fn respond(self, hook: &str, response: HookResponse, heartbeats: u32) -> Self {
        self.queue
            .borrow_mut()
            .entry(hook.to_string())
            .or_default()
            .push_back(Scripted {
                response,
                heartbeats,
            });
        self
    }

    /// Queue a hook that runs past its timeout.
    pub fn time_out(self, hook: &str, heartbeats: u32) -> Self {
        self.respond(
            hook,
            HookResponse {
                stdout: String::new(),
                exit_code: None,
                timed_out: true,
            },
            heartbeats,
        )
    }

    pub fn calls(&self) -> Vec<HookRequest> {
        self.calls.borrow().clone()
    }

    pub fn hooks_called(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.hook.clone()).collect()
    }
}

impl HookRunner for ScriptedHookRunner {
    fn run(
        &self,
        request: &HookRequest,
        on_heartbeat: &mut dyn FnMut() -> Result<()>,
    ) -> Result<HookResponse> {
        self.calls.borrow_mut().push(request.clone());
        let scripted = self
            .queue
            .borrow_mut()
            .get_mut(&request.hook)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted response for hook '{}'", request.hook))?;
        for _ in 0..scripted.heartbeats {
            on_heartbeat()?;
        }
        Ok(scripted.response)
    }
}
