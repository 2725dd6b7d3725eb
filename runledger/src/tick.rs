//! Orchestration for `runledger run tick`: reconcile, execute, repeat.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::state::RunStatus;
use crate::hook_exec::{ExecOutcome, PlanExecutor, PlanReport};
use crate::reconcile::{derive_run, reconcile};

/// Why `tick` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStop {
    /// DONE or FAILED.
    Terminal,
    /// Waiting on a human or on dependent runs.
    Blocked,
    /// A hook outcome was inconclusive or the plan was a no-op.
    Stalled,
    /// `max_transitions` reached.
    Budget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stop: TickStop,
    pub transitions: u32,
    pub reports: Vec<PlanReport>,
}

impl TickOutcome {
    pub fn is_blocked(&self) -> bool {
        self.status.is_blocked()
    }
}

/// Run up to `max_transitions` reconcile/execute cycles on one run.
#[instrument(skip_all, fields(run_id = %run_id, max_transitions = max_transitions))]
pub fn tick(executor: &mut PlanExecutor<'_>, run_id: &str, max_transitions: u32) -> Result<TickOutcome> {
    let mut reports = Vec::new();
    let mut transitions = 0;
    let mut stop = TickStop::Budget;

    while transitions < max_transitions {
        let rec = reconcile(&mut *executor.journal, executor.resolver, run_id)?;
        let Some(plan) = rec.plan else {
            stop = TickStop::Terminal;
            break;
        };
        let report = executor.exec_plan(&plan, false)?;
        let progressed = report.made_progress();
        let waiting = matches!(
            report.outcome,
            ExecOutcome::Waiting | ExecOutcome::WaitingOnDeps
        );
        reports.push(report);
        if waiting {
            stop = TickStop::Blocked;
            break;
        }
        if !progressed {
            stop = TickStop::Stalled;
            break;
        }
        transitions += 1;
    }

    let (_, state) = derive_run(&*executor.journal, run_id)?;
    if state.status.is_terminal() {
        stop = TickStop::Terminal;
    } else if state.status.is_blocked() {
        stop = TickStop::Blocked;
    }
    info!(status = ?state.status, stop = ?stop, transitions, "tick finished");
    Ok(TickOutcome {
        run_id: run_id.to_string(),
        status: state.status,
        stop,
        transitions,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedHookRunner, TestLedger, breakpoint_template, ok_output, two_agent_template,
    };

    #[test]
    fn tick_drives_a_run_to_done() {
        let mut ledger = TestLedger::new();
        ledger.dispatch(&two_agent_template(), "run-1");
        let runner = ScriptedHookRunner::new()
            .reply("agent", ok_output("designed"))
            .reply("agent", ok_output("built"));
        let settings = ledger.settings();
        let out = tick(&mut ledger.executor(&runner, &settings), "run-1", 10).expect("tick");
        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.stop, TickStop::Terminal);
        assert_eq!(out.transitions, 3);
        assert_eq!(ledger.kinds("run-1").last().map(String::as_str), Some("run.completed"));
    }

    #[test]
    fn tick_respects_the_transition_budget() {
        let mut ledger = TestLedger::new();
        ledger.dispatch(&two_agent_template(), "run-1");
        let runner = ScriptedHookRunner::new().reply("agent", ok_output("designed"));
        let settings = ledger.settings();
        let out = tick(&mut ledger.executor(&runner, &settings), "run-1", 1).expect("tick");
        assert_eq!(out.stop, TickStop::Budget);
        assert_eq!(out.transitions, 1);
        assert_eq!(out.status, RunStatus::Active);
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn tick_stops_at_a_breakpoint() {
        let mut ledger = TestLedger::new();
        ledger.dispatch(&breakpoint_template(), "run-1");
        let runner = ScriptedHookRunner::new().reply("agent", ok_output("designed"));
        let settings = ledger.settings();
        let out = tick(&mut ledger.executor(&runner, &settings), "run-1", 10).expect("tick");
        assert!(out.is_blocked());
        assert_eq!(out.stop, TickStop::Blocked);
        assert_eq!(out.status, RunStatus::WaitHuman);
        assert_eq!(ledger.kinds("run-1").last().map(String::as_str), Some("run.human.waiting"));
    }
}
