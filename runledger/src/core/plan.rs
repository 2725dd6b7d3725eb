//! The planner: one proposed transition per derived state.
//!
//! Planning is pure and cheap. It never looks at the wall clock and never
//! writes anything; a [`Plan`] only takes effect once the executor appends its
//! `events_to_emit_before`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::event::{HumanWaiting, RedoRequested, RunEvent, WaitReason};
use crate::core::state::{Phase, RunState, RunStatus};
use crate::core::template::{Playbook, Step, StepType};

pub const STEP_COMPLETED: &str = "run.step.completed";
pub const STEP_FAILED: &str = "run.step.failed";
pub const REWARD_REPORTED: &str = "run.reward.reported";

/// Maps a step to the hook program that executes it.
pub trait HookResolver {
    fn resolve(&self, step_type: StepType, profile: Option<&str>) -> String;
}

impl<F> HookResolver for F
where
    F: Fn(StepType, Option<&str>) -> String,
{
    fn resolve(&self, step_type: StepType, profile: Option<&str>) -> String {
        self(step_type, profile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanKind {
    ExecuteStep,
    WaitHuman,
    WaitDeps,
    Done,
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Document a step hook receives on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub run_id: String,
    pub step_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub agent: AgentInput,
    pub state: RunState,
    /// The step's own template entry.
    pub template: Step,
    pub hook_mapping: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub run_id: String,
    pub kind: PlanKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_input: Option<StepInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events_to_emit_before: Vec<RunEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events_expected_after: Vec<String>,
    /// Dependent runs still pending (`WAIT_DEPS`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Plan {
    fn bare(state: &RunState, kind: PlanKind) -> Plan {
        Plan {
            run_id: state.run_id.clone(),
            kind,
            step_id: None,
            attempt: None,
            step_type: None,
            hook: None,
            hook_input: None,
            events_to_emit_before: Vec::new(),
            events_expected_after: Vec::new(),
            pending: Vec::new(),
            reason: None,
        }
    }

    fn at_current(mut self, state: &RunState) -> Plan {
        self.step_id = state.current.step_id.clone();
        self.attempt = self.step_id.as_ref().map(|_| state.current.attempt);
        self
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Plan {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, PlanKind::WaitHuman | PlanKind::WaitDeps)
    }
}

/// Propose the next transition for `state`, or `None` for a finished run.
pub fn plan(state: &RunState, playbook: &Playbook, resolver: &dyn HookResolver) -> Option<Plan> {
    if state.status.is_terminal() {
        return None;
    }

    if let Some(waiting) = &state.waiting {
        let mut plan = Plan::bare(state, PlanKind::WaitHuman).with_reason(waiting.message.clone());
        plan.step_id = waiting.step_id.clone();
        plan.attempt = waiting.step_id.as_ref().map(|_| waiting.attempt);
        return Some(plan);
    }

    if state.status == RunStatus::WaitDeps || state.blocked_on_deps(playbook) {
        let mut plan = Plan::bare(state, PlanKind::WaitDeps).at_current(state);
        plan.pending = state.deps.pending.clone();
        return Some(plan);
    }

    let ctx = state.guard_context();

    let Some(step_id) = state.current.step_id.as_deref() else {
        if !state.finalize_resumed
            && let Some(guard) = playbook.run_guards().find(|g| g.expr.eval(&ctx))
        {
            let mut plan = Plan::bare(state, PlanKind::WaitHuman).with_reason(&guard.rule.message);
            plan.events_to_emit_before = vec![RunEvent::HumanWaiting(HumanWaiting {
                step_id: None,
                attempt: 0,
                reason: WaitReason::Cbp,
                cbp_id: Some(guard.rule.id.clone()),
                message: guard.rule.message.clone(),
            })];
            return Some(plan);
        }
        let mut plan = Plan::bare(state, PlanKind::Done);
        plan.events_to_emit_before = vec![RunEvent::Completed(serde_json::Map::new())];
        return Some(plan);
    };

    let Some(step) = playbook.step(step_id) else {
        return Some(
            Plan::bare(state, PlanKind::Noop)
                .at_current(state)
                .with_reason(format!("step '{step_id}' is not in the template")),
        );
    };
    if state.current.phase == Phase::Executing {
        return Some(
            Plan::bare(state, PlanKind::Noop)
                .at_current(state)
                .with_reason("attempt already in flight"),
        );
    }
    let attempt = state.current.attempt;
    let released = state.is_resumed(step_id, attempt);

    if !released && let Some(guard) = playbook.step_guards(step_id).find(|g| g.expr.eval(&ctx)) {
        let mut plan = Plan::bare(state, PlanKind::WaitHuman)
            .at_current(state)
            .with_reason(&guard.rule.message);
        plan.events_to_emit_before = vec![RunEvent::HumanWaiting(HumanWaiting {
            step_id: Some(step_id.to_string()),
            attempt,
            reason: WaitReason::Cbp,
            cbp_id: Some(guard.rule.id.clone()),
            message: guard.rule.message.clone(),
        })];
        return Some(plan);
    }

    if !released && step.breakpoint_enabled() {
        let message = step
            .breakpoint
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| format!("breakpoint before step '{step_id}'"));
        let mut plan = Plan::bare(state, PlanKind::WaitHuman)
            .at_current(state)
            .with_reason(&message);
        plan.events_to_emit_before = vec![RunEvent::HumanWaiting(HumanWaiting {
            step_id: Some(step_id.to_string()),
            attempt,
            reason: WaitReason::Breakpoint,
            cbp_id: None,
            message,
        })];
        return Some(plan);
    }

    if state.has_completed(step_id, attempt) {
        return Some(
            Plan::bare(state, PlanKind::Noop)
                .at_current(state)
                .with_reason("attempt already completed"),
        );
    }

    let profile = step.profile();
    let hook = resolver.resolve(step.step_type, profile);

    let mut before = Vec::new();
    if let Some(recovery) = state
        .recovery
        .as_ref()
        .filter(|r| r.target_step_id == step_id)
    {
        before.push(RunEvent::RedoRequested(RedoRequested {
            step_id: recovery.step_id.clone(),
            attempt: recovery.attempt,
            target_step_id: recovery.target_step_id.clone(),
            reason: recovery.reason.clone(),
        }));
    }
    before.push(RunEvent::started(step_id, attempt));

    let success = match step.step_type {
        StepType::Reward => REWARD_REPORTED,
        StepType::Agent | StepType::Human => STEP_COMPLETED,
    };
    let input = StepInput {
        run_id: state.run_id.clone(),
        step_id: step_id.to_string(),
        attempt,
        instructions: step.instructions.clone(),
        agent: AgentInput {
            profile: profile.map(str::to_string),
        },
        state: state.clone(),
        template: step.clone(),
        hook_mapping: serde_json::json!({
            "step_type": step.step_type.as_str(),
            "profile": profile,
            "hook": hook,
        }),
    };

    let mut plan = Plan::bare(state, PlanKind::ExecuteStep).at_current(state);
    plan.step_type = Some(step.step_type);
    plan.hook = Some(hook);
    plan.hook_input = Some(input);
    plan.events_to_emit_before = before;
    plan.events_expected_after = vec![success.to_string(), STEP_FAILED.to_string()];
    Some(plan)
}
