//! Run state derivation.
//!
//! [`derive`] folds a run's journal into a [`RunState`]. The fold is total:
//! events that do not apply to the current position (stale attempts, unknown
//! kinds, anything after a terminal event) are ignored, so any process can
//! replay any prefix of the journal and arrive at the same answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::event::{Event, HumanWaiting, ParentRef, RunEvent, StepRef, WaitReason};
use crate::core::reward::{Decision, RewardReport};
use crate::core::template::{OnFail, Playbook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Active,
    WaitHuman,
    WaitDeps,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, RunStatus::WaitHuman | RunStatus::WaitDeps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Executing,
    HumanWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Current {
    /// `None` once the run has moved past its last step.
    pub step_id: Option<String>,
    pub attempt: u32,
    pub phase: Phase,
    /// Time of the last start, exec start or heartbeat of this attempt.
    pub last_activity_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Highest attempt number started so far.
    pub attempts: u32,
    pub last_outcome: Option<Outcome>,
    pub completed_attempts: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deps {
    pub pending: Vec<String>,
    pub completed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardState {
    pub latest: Option<RewardReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    Redo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recovery {
    pub kind: RecoveryKind,
    /// Step and attempt whose outcome triggered the redo.
    pub step_id: String,
    pub attempt: u32,
    pub target_step_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiting {
    pub reason: WaitReason,
    pub step_id: Option<String>,
    pub attempt: u32,
    pub message: String,
    pub cbp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub template_id: String,
    pub version: String,
    pub status: RunStatus,
    pub current: Current,
    pub steps: BTreeMap<String, StepRecord>,
    pub deps: Deps,
    pub reward: RewardState,
    pub recovery: Option<Recovery>,
    pub waiting: Option<Waiting>,
    /// Attempts released from a breakpoint or conditional breakpoint.
    pub resumed: Vec<StepRef>,
    /// A run-scope guard was acknowledged by a human.
    pub finalize_resumed: bool,
    pub parent: Option<ParentRef>,
    pub failure: Option<String>,
}

impl RunState {
    fn new(run_id: &str, playbook: &Playbook) -> RunState {
        let first = playbook.steps().first().map(|s| s.step_id.clone());
        RunState {
            run_id: run_id.to_string(),
            template_id: playbook.template.template_id.clone(),
            version: playbook.template.version.clone(),
            status: RunStatus::Active,
            current: Current {
                step_id: first,
                attempt: 1,
                phase: Phase::Idle,
                last_activity_at: None,
            },
            steps: BTreeMap::new(),
            deps: Deps::default(),
            reward: RewardState::default(),
            recovery: None,
            waiting: None,
            resumed: Vec::new(),
            finalize_resumed: false,
            parent: None,
            failure: None,
        }
    }

    /// Context guard expressions are evaluated against: `{state: ...}`.
    pub fn guard_context(&self) -> Value {
        json!({ "state": self })
    }

    pub fn is_resumed(&self, step_id: &str, attempt: u32) -> bool {
        self.resumed
            .iter()
            .any(|r| r.step_id == step_id && r.attempt == attempt)
    }

    pub fn has_completed(&self, step_id: &str, attempt: u32) -> bool {
        self.steps
            .get(step_id)
            .is_some_and(|r| r.completed_attempts.contains(&attempt))
    }

    /// Whether the run cannot move until dependent runs finish.
    pub fn blocked_on_deps(&self, playbook: &Playbook) -> bool {
        if self.deps.pending.is_empty() {
            return false;
        }
        match self.current.step_id.as_deref() {
            None => true,
            Some(step_id) => playbook
                .step(step_id)
                .is_some_and(|s| s.awaits_dependencies()),
        }
    }

    fn is_current(&self, step_id: &str, attempt: u32) -> bool {
        self.current.step_id.as_deref() == Some(step_id) && self.current.attempt == attempt
    }

    fn record(&mut self, step_id: &str) -> &mut StepRecord {
        self.steps.entry(step_id.to_string()).or_default()
    }

    fn next_attempt(&self, step_id: &str) -> u32 {
        self.steps.get(step_id).map_or(0, |r| r.attempts) + 1
    }

    fn move_to(&mut self, step_id: Option<String>) {
        let attempt = step_id.as_deref().map_or(0, |s| self.next_attempt(s));
        self.current = Current {
            step_id,
            attempt,
            phase: Phase::Idle,
            last_activity_at: None,
        };
    }

    fn apply(&mut self, playbook: &Playbook, event: &Event, run_event: RunEvent) {
        if self.status.is_terminal() {
            return;
        }
        match run_event {
            RunEvent::Dispatched(dispatched) => {
                self.parent = dispatched.parent;
            }
            RunEvent::StepScheduled(r) | RunEvent::StepStarted(r) => {
                if playbook.step(&r.step_id).is_none()
                    || self.waiting.is_some()
                    || self.current.step_id.as_deref() != Some(r.step_id.as_str())
                    || r.attempt < self.current.attempt
                    || self.has_completed(&r.step_id, r.attempt)
                {
                    return;
                }
                let record = self.record(&r.step_id);
                record.attempts = record.attempts.max(r.attempt);
                self.current = Current {
                    step_id: Some(r.step_id),
                    attempt: r.attempt,
                    phase: Phase::Executing,
                    last_activity_at: Some(event.time.clone()),
                };
            }
            RunEvent::ExecStarted(e) => self.touch(&e.step_id, e.attempt, &event.time),
            RunEvent::Heartbeat(r) => self.touch(&r.step_id, r.attempt, &event.time),
            RunEvent::StepCompleted(e) => {
                if self.is_current(&e.step_id, e.attempt) {
                    self.complete_current();
                }
            }
            RunEvent::StepFailed(e) => {
                if self.is_current(&e.step_id, e.attempt) {
                    self.fail_current(playbook, &e.reason);
                }
            }
            RunEvent::RedoRequested(e) => {
                if self
                    .recovery
                    .as_ref()
                    .is_some_and(|r| r.target_step_id == e.target_step_id)
                {
                    self.recovery = None;
                }
            }
            RunEvent::RewardReported(e) => {
                if !self.is_current(&e.step_id, e.attempt) {
                    return;
                }
                let decision = e.report.decision;
                let total = e.report.reward_total;
                self.reward.latest = Some(e.report);
                match decision {
                    Decision::Pass => self.complete_current(),
                    Decision::Redo | Decision::Fail => {
                        let reason = format!("reward {} (total {total:.3})", decision.as_str());
                        self.fail_current(playbook, &reason);
                    }
                    Decision::EscalateBp => {
                        self.current.phase = Phase::Idle;
                        self.waiting = Some(Waiting {
                            reason: WaitReason::Escalation,
                            step_id: Some(e.step_id),
                            attempt: e.attempt,
                            message: format!("reward total {total:.3} needs human judgement"),
                            cbp_id: None,
                        });
                    }
                }
            }
            RunEvent::DepSpawned(e) => {
                if !self.deps.pending.contains(&e.dep_run_id)
                    && !self.deps.completed.contains(&e.dep_run_id)
                {
                    self.deps.pending.push(e.dep_run_id);
                }
            }
            RunEvent::DepCompleted(e) => {
                self.deps.pending.retain(|id| id != &e.dep_run_id);
                if !self.deps.completed.contains(&e.dep_run_id) {
                    self.deps.completed.push(e.dep_run_id);
                }
            }
            RunEvent::HumanWaiting(w) => self.wait(w),
            RunEvent::HumanResumed(_) => self.resume(),
            RunEvent::ExecTimedOut(e) => {
                if !self.is_current(&e.step_id, e.attempt) || self.current.phase != Phase::Executing
                {
                    return;
                }
                self.record(&e.step_id).last_outcome = Some(Outcome::TimedOut);
                self.current.phase = Phase::Idle;
                self.waiting = Some(Waiting {
                    reason: WaitReason::Timeout,
                    step_id: Some(e.step_id),
                    attempt: e.attempt,
                    message: format!("no activity for {}s", e.idle_secs),
                    cbp_id: None,
                });
            }
            RunEvent::Completed(_) => {
                self.status = RunStatus::Done;
                self.current.step_id = None;
                self.current.phase = Phase::Idle;
                self.waiting = None;
            }
            RunEvent::Failed(f) => {
                self.status = RunStatus::Failed;
                self.current.phase = Phase::Idle;
                self.failure = Some(f.reason);
            }
        }
    }

    fn touch(&mut self, step_id: &str, attempt: u32, time: &str) {
        if self.is_current(step_id, attempt) && self.current.phase == Phase::Executing {
            self.current.last_activity_at = Some(time.to_string());
        }
    }

    fn complete_current(&mut self) {
        let Some(step_id) = self.current.step_id.clone() else {
            return;
        };
        let attempt = self.current.attempt;
        let record = self.record(&step_id);
        record.last_outcome = Some(Outcome::Completed);
        if !record.completed_attempts.contains(&attempt) {
            record.completed_attempts.push(attempt);
        }
        self.current.phase = Phase::Idle;
    }

    fn fail_current(&mut self, playbook: &Playbook, reason: &str) {
        let Some(step_id) = self.current.step_id.clone() else {
            return;
        };
        let attempt = self.current.attempt;
        self.record(&step_id).last_outcome = Some(Outcome::Failed);
        self.current.phase = Phase::Idle;

        let Some(step) = playbook.step(&step_id) else {
            return;
        };
        if step.on_fail() != OnFail::AutoRedo {
            self.status = RunStatus::Failed;
            self.failure = Some(format!("step '{step_id}' attempt {attempt} failed: {reason}"));
            return;
        }

        let target = step.redo_target().to_string();
        let next = self.next_attempt(&target);
        if let Some(max) = step.max_attempts()
            && next > max
        {
            self.status = RunStatus::Failed;
            self.failure = Some(format!(
                "step '{target}' exhausted {max} attempt(s): {reason}"
            ));
            return;
        }
        self.recovery = Some(Recovery {
            kind: RecoveryKind::Redo,
            step_id,
            attempt,
            target_step_id: target.clone(),
            reason: reason.to_string(),
        });
        self.current = Current {
            step_id: Some(target),
            attempt: next,
            phase: Phase::Idle,
            last_activity_at: None,
        };
    }

    fn wait(&mut self, w: HumanWaiting) {
        self.current.phase = Phase::HumanWait;
        self.waiting = Some(Waiting {
            reason: w.reason,
            step_id: w.step_id,
            attempt: w.attempt,
            message: w.message,
            cbp_id: w.cbp_id,
        });
    }

    fn resume(&mut self) {
        let Some(waiting) = self.waiting.take() else {
            return;
        };
        self.current.phase = Phase::Idle;
        match (waiting.reason, waiting.step_id) {
            (WaitReason::Breakpoint | WaitReason::Cbp, Some(step_id)) => {
                self.resumed.push(StepRef {
                    step_id,
                    attempt: waiting.attempt,
                });
            }
            (WaitReason::Breakpoint | WaitReason::Cbp, None) => {
                self.finalize_resumed = true;
            }
            (WaitReason::Timeout | WaitReason::Escalation, Some(step_id)) => {
                if self.current.step_id.as_deref() == Some(step_id.as_str()) {
                    self.current.attempt = self.next_attempt(&step_id);
                    self.current.last_activity_at = None;
                }
            }
            (WaitReason::Timeout | WaitReason::Escalation, None) => {}
        }
    }

    /// Recompute status and advance past completed steps.
    fn settle(&mut self, playbook: &Playbook) {
        if self.status.is_terminal() {
            return;
        }
        if self.waiting.is_some() {
            self.status = RunStatus::WaitHuman;
            self.current.phase = Phase::HumanWait;
            return;
        }
        while let Some(step_id) = self.current.step_id.clone() {
            if !self.has_completed(&step_id, self.current.attempt) {
                break;
            }
            if self.blocked_on_deps(playbook) {
                self.status = RunStatus::WaitDeps;
                return;
            }
            let next = playbook
                .step_index(&step_id)
                .and_then(|i| playbook.steps().get(i + 1))
                .map(|s| s.step_id.clone());
            self.move_to(next);
        }
        self.status = if self.blocked_on_deps(playbook) {
            RunStatus::WaitDeps
        } else {
            RunStatus::Active
        };
    }
}

/// Replay `events` (journal order) into the state of `run_id`.
pub fn derive(run_id: &str, playbook: &Playbook, events: &[Event]) -> RunState {
    let mut state = RunState::new(run_id, playbook);
    for event in events {
        if let Ok(Some(run_event)) = event.run_event() {
            state.apply(playbook, event, run_event);
            state.settle(playbook);
        }
    }
    state
}
