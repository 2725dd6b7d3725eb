//! Orchestration for `runledger hook exec`: realize plans.
//!
//! A plan is advisory. Before acting, the executor re-derives the run and
//! re-plans; if the fresh plan is not the same transition the run has moved
//! on and the plan is reported stale. Otherwise the plan's `before` events
//! are appended, the hook runs under heartbeat supervision, and its output
//! document decides which terminal event (if any) is recorded.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::event::{DepSpawned, ExecStarted, ParentRef, RewardReported, RunEvent, StepRef};
use crate::core::plan::{HookResolver, Plan, PlanKind, plan};
use crate::core::reward::{Decision, EvidenceRecord, RewardReport, SignalEvidence, score};
use crate::core::template::{Playbook, Step, StepType};
use crate::dispatch::dispatch_run;
use crate::io::config::{EngineConfig, InvalidOutputPolicy, LEDGER_DIR};
use crate::io::hooks::{HookRequest, HookResponse, HookRunner};
use crate::io::instructions::render_instructions;
use crate::io::journal::Journal;
use crate::io::schema::{self, Document};
use crate::io::template_store::{build_playbook, read_document, resolve_template_path};
use crate::reconcile::derive_run;

/// Executor tunables, resolved from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub root: PathBuf,
    pub templates_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub hook_timeout: Duration,
    pub output_limit_bytes: usize,
    pub validate_hook_io: bool,
    pub invalid_output: InvalidOutputPolicy,
}

impl ExecSettings {
    pub fn from_config(root: &Path, config: &EngineConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            templates_dir: config.templates_dir.clone(),
            heartbeat_interval: Duration::from_millis(config.exec.heartbeat_interval_ms),
            hook_timeout: Duration::from_secs(config.exec.hook_timeout_secs),
            output_limit_bytes: config.exec.output_limit_bytes,
            validate_hook_io: config.exec.validate_hook_io,
            invalid_output: config.exec.invalid_output,
        }
    }
}

/// A hook broke its output contract. Never fatal: the attempt is left
/// unresolved (or failed, per `invalid_output`).
#[derive(Debug, Error)]
pub enum HookContractError {
    #[error("hook '{hook}' timed out after {secs}s")]
    TimedOut { hook: String, secs: u64 },
    #[error("{0}")]
    InvalidOutput(String),
}

/// How one plan was handled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed,
    Failed { reason: String },
    RewardReported { decision: Decision },
    Waiting,
    WaitingOnDeps,
    Done,
    Noop,
    /// Nothing terminal was recorded; the attempt stays in flight until swept.
    Inconclusive { reason: String },
    /// The run moved on since the plan was made.
    Stale { reason: String },
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub run_id: String,
    pub kind: PlanKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(flatten)]
    pub outcome: ExecOutcome,
    /// Event kinds appended (on a dry run: the kinds that would be appended first).
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub heartbeats: u32,
}

impl PlanReport {
    fn new(plan: &Plan, outcome: ExecOutcome) -> Self {
        Self {
            run_id: plan.run_id.clone(),
            kind: plan.kind,
            step_id: plan.step_id.clone(),
            attempt: plan.attempt,
            outcome,
            events: Vec::new(),
            heartbeats: 0,
        }
    }

    /// Whether another tick could make progress right away.
    pub fn made_progress(&self) -> bool {
        matches!(
            self.outcome,
            ExecOutcome::Completed
                | ExecOutcome::Failed { .. }
                | ExecOutcome::RewardReported { .. }
                | ExecOutcome::Done
        )
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Hook output document.
#[derive(Debug, Clone, Deserialize)]
struct HookOutput {
    ok: bool,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    spawn: Vec<SpawnRequest>,
    #[serde(default)]
    reward_report: Option<RewardReport>,
    #[serde(default)]
    evidence: Vec<EvidenceRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpawnRequest {
    /// Inline template document, or a template reference.
    playbook: Value,
    #[serde(default)]
    patch: Option<Value>,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EvidenceOutput {
    ok: bool,
    #[serde(default)]
    evidence: Vec<EvidenceRecord>,
}

/// Parse a plan document: `{plans: [...]}` or a bare array.
pub fn parse_plans(document: Value) -> Result<Vec<Plan>> {
    schema::validate(Document::Plan, &document)?;
    let plans = match document {
        Value::Object(mut map) => map.remove("plans").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(plans).context("decode plans")
}

/// `.runledger/artifacts/<run_id>/<step_id>/<attempt>/`
pub fn artifact_dir(root: &Path, run_id: &str, step_id: &str, attempt: u32) -> PathBuf {
    root.join(LEDGER_DIR)
        .join("artifacts")
        .join(run_id)
        .join(step_id)
        .join(attempt.to_string())
}

/// Realizes plans against a journal.
pub struct PlanExecutor<'a> {
    pub journal: &'a mut dyn Journal,
    pub runner: &'a dyn HookRunner,
    pub resolver: &'a dyn HookResolver,
    pub settings: &'a ExecSettings,
}

impl PlanExecutor<'_> {
    /// Execute plans one at a time, in order.
    pub fn exec_plans(&mut self, plans: &[Plan], dry_run: bool) -> Result<Vec<PlanReport>> {
        plans
            .iter()
            .map(|plan| self.exec_plan(plan, dry_run))
            .collect()
    }

    #[instrument(skip_all, fields(run_id = %given.run_id, kind = ?given.kind, step_id = ?given.step_id, attempt = ?given.attempt, dry_run = dry_run))]
    pub fn exec_plan(&mut self, given: &Plan, dry_run: bool) -> Result<PlanReport> {
        let (record, state) = derive_run(self.journal, &given.run_id)?;
        let fresh = plan(&state, &record.playbook, self.resolver);
        let Some(fresh) = fresh.filter(|f| same_transition(f, given)) else {
            info!("plan is stale, skipping");
            return Ok(PlanReport::new(
                given,
                ExecOutcome::Stale {
                    reason: format!("run is {:?}; plan no longer applies", state.status),
                },
            ));
        };

        if dry_run {
            let mut report = PlanReport::new(&fresh, ExecOutcome::DryRun);
            report.events = kinds(&fresh.events_to_emit_before);
            return Ok(report);
        }

        match fresh.kind {
            PlanKind::WaitHuman => {
                let mut report = PlanReport::new(&fresh, ExecOutcome::Waiting);
                for event in &fresh.events_to_emit_before {
                    self.append(&fresh.run_id, event, &mut report)?;
                }
                Ok(report)
            }
            PlanKind::Done => {
                let mut report = PlanReport::new(&fresh, ExecOutcome::Done);
                for event in &fresh.events_to_emit_before {
                    self.append(&fresh.run_id, event, &mut report)?;
                }
                info!("run completed");
                Ok(report)
            }
            PlanKind::WaitDeps => Ok(PlanReport::new(&fresh, ExecOutcome::WaitingOnDeps)),
            PlanKind::Noop => Ok(PlanReport::new(&fresh, ExecOutcome::Noop)),
            PlanKind::ExecuteStep => {
                self.execute_step(&record.playbook, &fresh)
            }
        }
    }

    fn append(&mut self, run_id: &str, event: &RunEvent, report: &mut PlanReport) -> Result<()> {
        self.journal.append(run_id, event)?;
        report.events.push(event.kind().to_string());
        Ok(())
    }

    fn execute_step(&mut self, playbook: &Playbook, fresh: &Plan) -> Result<PlanReport> {
        let run_id = fresh.run_id.as_str();
        let (step_id, attempt) = match (&fresh.step_id, fresh.attempt) {
            (Some(step_id), Some(attempt)) => (step_id.as_str(), attempt),
            _ => return Err(anyhow!("execute plan for '{run_id}' has no step coordinates")),
        };
        let step = playbook
            .step(step_id)
            .ok_or_else(|| anyhow!("step '{step_id}' is not in the template"))?;
        let hook = fresh
            .hook
            .clone()
            .ok_or_else(|| anyhow!("execute plan for '{step_id}' has no hook"))?;
        let artifacts = artifact_dir(&self.settings.root, run_id, step_id, attempt);

        let mut input = fresh
            .hook_input
            .clone()
            .ok_or_else(|| anyhow!("execute plan for '{step_id}' has no hook input"))?;
        if let Some(source) = &input.instructions {
            input.instructions = Some(render_instructions(
                source,
                run_id,
                step_id,
                attempt,
                &input.state,
            )?);
        }
        let input = serde_json::to_value(&input).context("serialize hook input")?;
        if self.settings.validate_hook_io {
            schema::validate(Document::HookInput, &input).context("hook input")?;
        }
        write_json(&artifacts.join("input.json"), &input)?;

        let mut report = PlanReport::new(fresh, ExecOutcome::Noop);
        for event in &fresh.events_to_emit_before {
            self.append(run_id, event, &mut report)?;
        }
        let started = RunEvent::ExecStarted(ExecStarted {
            step_id: step_id.to_string(),
            attempt,
            hook: hook.clone(),
        });
        self.append(run_id, &started, &mut report)?;

        let resolved = self
            .run_hook(run_id, step_id, attempt, &hook, input, artifacts.clone(), &mut report)
            .and_then(|response| {
                self.resolve_output(playbook, step, run_id, attempt, &hook, &response, &artifacts, &mut report)
            });

        let (events, outcome) = match resolved {
            Ok(resolution) => resolution,
            Err(err) => match err.downcast_ref::<HookContractError>() {
                Some(HookContractError::TimedOut { .. }) => {
                    warn!(err = %err, "hook timed out, attempt left unresolved");
                    (
                        Vec::new(),
                        ExecOutcome::Inconclusive {
                            reason: err.to_string(),
                        },
                    )
                }
                Some(HookContractError::InvalidOutput(reason)) => {
                    warn!(reason = %reason, policy = ?self.settings.invalid_output, "invalid hook output");
                    match self.settings.invalid_output {
                        InvalidOutputPolicy::Inconclusive => (
                            Vec::new(),
                            ExecOutcome::Inconclusive {
                                reason: reason.clone(),
                            },
                        ),
                        InvalidOutputPolicy::Fail => (
                            vec![RunEvent::failed(step_id, attempt, "invalid_output")],
                            ExecOutcome::Failed {
                                reason: "invalid_output".to_string(),
                            },
                        ),
                    }
                }
                None => return Err(err),
            },
        };

        for event in &events {
            self.append(run_id, event, &mut report)?;
        }
        report.outcome = outcome;
        debug!(outcome = ?report.outcome, "step executed");
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_hook(
        &mut self,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        hook: &str,
        input: Value,
        artifacts: PathBuf,
        report: &mut PlanReport,
    ) -> Result<HookResponse> {
        let request = HookRequest {
            hook: hook.to_string(),
            input,
            workdir: self.settings.root.clone(),
            artifact_dir: artifacts,
            timeout: self.settings.hook_timeout,
            heartbeat_interval: self.settings.heartbeat_interval,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let runner = self.runner;
        let journal = &mut *self.journal;
        let heartbeat = RunEvent::Heartbeat(StepRef {
            step_id: step_id.to_string(),
            attempt,
        });
        let mut beats = 0u32;
        let response = runner.run(&request, &mut || {
            journal.append(run_id, &heartbeat)?;
            beats += 1;
            Ok(())
        })?;
        report.heartbeats += beats;
        if response.timed_out {
            return Err(HookContractError::TimedOut {
                hook: hook.to_string(),
                secs: self.settings.hook_timeout.as_secs(),
            }
            .into());
        }
        Ok(response)
    }

    /// Turn a hook response into the events that close the attempt.
    #[allow(clippy::too_many_arguments)]
    fn resolve_output(
        &mut self,
        playbook: &Playbook,
        step: &Step,
        run_id: &str,
        attempt: u32,
        hook: &str,
        response: &HookResponse,
        artifacts: &Path,
        report: &mut PlanReport,
    ) -> Result<(Vec<RunEvent>, ExecOutcome)> {
        let step_id = step.step_id.as_str();
        let document = response.document().ok_or_else(|| {
            HookContractError::InvalidOutput(format!(
                "hook '{hook}' printed no JSON document (exit code {:?})",
                response.exit_code
            ))
        })?;
        write_json(&artifacts.join("output.json"), &document)?;
        let output = self.check_document(Document::HookOutput, &document, hook)?;
        let output: HookOutput = serde_json::from_value(output).map_err(|err| {
            HookContractError::InvalidOutput(format!("hook '{hook}' output: {err}"))
        })?;

        if !output.ok {
            let reason = output
                .reason
                .or(output.summary)
                .unwrap_or_else(|| "hook reported failure".to_string());
            info!(reason = %reason, "hook reported failure");
            return Ok((
                vec![RunEvent::failed(step_id, attempt, reason.clone())],
                ExecOutcome::Failed { reason },
            ));
        }
        if response.exit_code != Some(0) {
            return Err(HookContractError::InvalidOutput(format!(
                "hook '{hook}' reported ok but exited with {:?}",
                response.exit_code
            ))
            .into());
        }

        let (completion, outcome) = match step.step_type {
            StepType::Reward => {
                let report_doc = match output.reward_report {
                    Some(provided) => provided,
                    None => {
                        let evidence =
                            self.gather_evidence(playbook, step, run_id, attempt, &output.evidence, artifacts, report)?;
                        score(&playbook.template, step, &evidence)
                    }
                };
                let decision = report_doc.decision;
                info!(decision = decision.as_str(), total = report_doc.reward_total, "reward scored");
                (
                    RunEvent::RewardReported(RewardReported {
                        step_id: step_id.to_string(),
                        attempt,
                        report: report_doc,
                    }),
                    ExecOutcome::RewardReported { decision },
                )
            }
            StepType::Agent | StepType::Human => (
                RunEvent::completed(step_id, attempt, output.summary.clone()),
                ExecOutcome::Completed,
            ),
        };

        let mut events = self.spawn_children(step, run_id, &output.spawn)?;
        events.push(completion);
        Ok((events, outcome))
    }

    /// Schema-check a hook document when validation is enabled.
    fn check_document(&self, doc: Document, value: &Value, hook: &str) -> Result<Value> {
        if self.settings.validate_hook_io {
            let problems = schema::violations(doc, value);
            if !problems.is_empty() {
                return Err(HookContractError::InvalidOutput(format!(
                    "hook '{hook}' {} failed schema validation: {}",
                    doc.name(),
                    problems.join("; ")
                ))
                .into());
            }
        }
        Ok(value.clone())
    }

    /// Evidence per signal: records the step hook returned (grouped by
    /// `kind`) plus whatever each signal's producer reports.
    #[allow(clippy::too_many_arguments)]
    fn gather_evidence(
        &mut self,
        playbook: &Playbook,
        step: &Step,
        run_id: &str,
        attempt: u32,
        hook_records: &[EvidenceRecord],
        artifacts: &Path,
        report: &mut PlanReport,
    ) -> Result<BTreeMap<String, SignalEvidence>> {
        let mut evidence: BTreeMap<String, SignalEvidence> = BTreeMap::new();
        let signals = step.reward.as_ref().map(|r| r.signals.clone()).unwrap_or_default();
        for record in hook_records {
            if signals.contains(&record.kind) {
                evidence
                    .entry(record.kind.clone())
                    .or_insert_with(|| SignalEvidence {
                        ok: true,
                        records: Vec::new(),
                    })
                    .records
                    .push(record.clone());
            }
        }

        for signal_id in &signals {
            let Some(producer) = playbook.template.evidence_producers.get(signal_id) else {
                continue;
            };
            let root = artifacts.join(signal_id);
            let input = json!({
                "run_id": run_id,
                "step_id": step.step_id,
                "attempt": attempt,
                "signal_id": signal_id,
                "producer": producer.hook,
                "producer_args": producer.args,
                "artifact_root": root.to_string_lossy(),
            });
            if self.settings.validate_hook_io {
                schema::validate(Document::EvidenceInput, &input).context("evidence input")?;
            }
            let response =
                self.run_hook(run_id, &step.step_id, attempt, &producer.hook, input, root.clone(), report)?;
            let document = response.document().ok_or_else(|| {
                HookContractError::InvalidOutput(format!(
                    "evidence producer '{}' for signal '{signal_id}' printed no JSON document",
                    producer.hook
                ))
            })?;
            write_json(&root.join("evidence.json"), &document)?;
            let document = self.check_document(Document::EvidenceOutput, &document, &producer.hook)?;
            let produced: EvidenceOutput = serde_json::from_value(document).map_err(|err| {
                HookContractError::InvalidOutput(format!(
                    "evidence producer '{}' output: {err}",
                    producer.hook
                ))
            })?;
            debug!(signal_id = %signal_id, ok = produced.ok, records = produced.evidence.len(), "evidence produced");
            let entry = evidence.entry(signal_id.clone()).or_insert_with(|| SignalEvidence {
                ok: true,
                records: Vec::new(),
            });
            entry.ok &= produced.ok;
            entry.records.extend(produced.evidence);
        }
        Ok(evidence)
    }

    /// Dispatch child runs requested by the hook; returns the `run.dep.spawned` events.
    fn spawn_children(
        &mut self,
        step: &Step,
        run_id: &str,
        requests: &[SpawnRequest],
    ) -> Result<Vec<RunEvent>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if !step.allows_spawn() {
            warn!(step_id = %step.step_id, count = requests.len(), "step does not allow spawn, ignoring");
            return Ok(Vec::new());
        }

        // Resolve every template before dispatching anything.
        let mut playbooks = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let playbook = self.spawn_playbook(request).map_err(|err| {
                HookContractError::InvalidOutput(format!("spawn[{index}]: {err:#}"))
            })?;
            playbooks.push(playbook);
        }

        let existing = self.journal.list_runs()?;
        let mut events = Vec::with_capacity(requests.len());
        for (request, playbook) in requests.iter().zip(&playbooks) {
            let dep_run_id = match &request.run_id {
                Some(id) if existing.contains(id) => {
                    debug!(dep_run_id = %id, "dependent run already dispatched");
                    id.clone()
                }
                requested => {
                    let parent = ParentRef {
                        run_id: run_id.to_string(),
                        step_id: step.step_id.clone(),
                    };
                    dispatch_run(self.journal, playbook, requested.as_deref(), Some(parent))?.run_id
                }
            };
            info!(dep_run_id = %dep_run_id, "dependent run spawned");
            events.push(RunEvent::DepSpawned(DepSpawned {
                step_id: step.step_id.clone(),
                dep_run_id,
            }));
        }
        Ok(events)
    }

    fn spawn_playbook(&self, request: &SpawnRequest) -> Result<Playbook> {
        let document = match &request.playbook {
            Value::String(reference) => {
                let path = resolve_template_path(
                    &self.settings.root,
                    &self.settings.templates_dir,
                    reference,
                )?;
                read_document(&path)?
            }
            inline => inline.clone(),
        };
        let patches: Vec<Value> = request.patch.iter().cloned().collect();
        build_playbook(document, &patches)
    }
}

fn same_transition(fresh: &Plan, given: &Plan) -> bool {
    fresh.kind == given.kind
        && fresh.step_id == given.step_id
        && (given.attempt.is_none() || fresh.attempt == given.attempt)
}

fn kinds(events: &[RunEvent]) -> Vec<String> {
    events.iter().map(|e| e.kind().to_string()).collect()
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
