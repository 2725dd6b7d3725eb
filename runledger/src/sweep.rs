//! Orchestration for `runledger run sweep`: turn stalled attempts into human waits.
//!
//! Sweep is the only place that compares journal times with "now". An
//! attempt whose last start, exec start or heartbeat is older than the idle
//! threshold gets `run.step.exec.timed_out` followed by `run.human.waiting`.
//! The attempt counter is left alone; resuming restarts the step at the
//! next attempt.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::event::{ExecTimedOut, HumanWaiting, RunEvent, WaitReason};
use crate::core::state::{Phase, RunState};
use crate::io::journal::Journal;
use crate::reconcile::derive_run;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedOutAttempt {
    pub run_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub scanned: usize,
    pub timed_out: Vec<TimedOutAttempt>,
}

/// Seconds since the current attempt's last activity, if it is executing.
pub fn idle_secs(state: &RunState, now: DateTime<Utc>) -> Option<u64> {
    if state.current.phase != Phase::Executing || state.status.is_terminal() {
        return None;
    }
    let last = state.current.last_activity_at.as_deref()?;
    let last = DateTime::parse_from_rfc3339(last).ok()?.with_timezone(&Utc);
    Some((now - last).num_seconds().max(0) as u64)
}

/// Sweep every run; stop after `max` conversions when given.
#[instrument(skip_all, fields(idle_secs = idle.as_secs(), max = ?max))]
pub fn sweep(
    journal: &mut dyn Journal,
    now: DateTime<Utc>,
    idle: Duration,
    max: Option<usize>,
) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();
    for run_id in journal.list_runs()? {
        if max.is_some_and(|max| outcome.timed_out.len() >= max) {
            debug!("sweep limit reached");
            break;
        }
        outcome.scanned += 1;
        let state = match derive_run(journal, &run_id) {
            Ok((_, state)) => state,
            Err(err) => {
                warn!(run_id = %run_id, err = %format!("{err:#}"), "skipping unreadable run");
                continue;
            }
        };
        let Some(idle_for) = idle_secs(&state, now) else {
            continue;
        };
        if idle_for <= idle.as_secs() {
            continue;
        }
        let Some(step_id) = state.current.step_id.clone() else {
            continue;
        };
        let attempt = state.current.attempt;

        journal.append(
            &run_id,
            &RunEvent::ExecTimedOut(ExecTimedOut {
                step_id: step_id.clone(),
                attempt,
                last_seen: state.current.last_activity_at.clone(),
                idle_secs: idle_for,
            }),
        )?;
        journal.append(
            &run_id,
            &RunEvent::HumanWaiting(HumanWaiting {
                step_id: Some(step_id.clone()),
                attempt,
                reason: WaitReason::Timeout,
                cbp_id: None,
                message: format!("step '{step_id}' attempt {attempt} idle for {idle_for}s"),
            }),
        )?;
        info!(run_id = %run_id, step_id = %step_id, attempt, idle_for, "attempt timed out");
        outcome.timed_out.push(TimedOutAttempt {
            run_id,
            step_id,
            attempt,
            idle_secs: idle_for,
        });
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RunStatus;
    use crate::test_support::{TestLedger, two_agent_template};

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn stale_attempt_becomes_a_timeout_wait() {
        let mut ledger = TestLedger::at("2025-01-01T00:00:00Z");
        ledger.dispatch(&two_agent_template(), "run-1");
        ledger.append("run-1", RunEvent::started("design", 1));

        let out = sweep(
            &mut ledger.journal,
            at("2025-01-01T00:20:00Z"),
            Duration::from_secs(600),
            None,
        )
        .expect("sweep");
        assert_eq!(
            out.timed_out,
            vec![TimedOutAttempt {
                run_id: "run-1".to_string(),
                step_id: "design".to_string(),
                attempt: 1,
                idle_secs: 1200,
            }]
        );
        let kinds = ledger.kinds("run-1");
        assert_eq!(
            &kinds[kinds.len() - 2..],
            ["run.step.exec.timed_out", "run.human.waiting"]
        );
        let state = ledger.state("run-1");
        assert_eq!(state.status, RunStatus::WaitHuman);
        assert_eq!(state.current.attempt, 1);

        // A second sweep finds nothing executing.
        let again = sweep(
            &mut ledger.journal,
            at("2025-01-01T01:00:00Z"),
            Duration::from_secs(600),
            None,
        )
        .expect("sweep");
        assert!(again.timed_out.is_empty());
    }

    #[test]
    fn fresh_heartbeat_keeps_attempt_alive() {
        let mut ledger = TestLedger::at("2025-01-01T00:00:00Z");
        ledger.dispatch(&two_agent_template(), "run-1");
        ledger.append("run-1", RunEvent::started("design", 1));
        let out = sweep(
            &mut ledger.journal,
            at("2025-01-01T00:05:00Z"),
            Duration::from_secs(600),
            None,
        )
        .expect("sweep");
        assert!(out.timed_out.is_empty());
        assert_eq!(out.scanned, 1);
    }

    #[test]
    fn max_bounds_conversions() {
        let mut ledger = TestLedger::at("2025-01-01T00:00:00Z");
        for run in ["run-a", "run-b"] {
            ledger.dispatch(&two_agent_template(), run);
            ledger.append(run, RunEvent::started("design", 1));
        }
        let out = sweep(
            &mut ledger.journal,
            at("2025-01-02T00:00:00Z"),
            Duration::from_secs(60),
            Some(1),
        )
        .expect("sweep");
        assert_eq!(out.timed_out.len(), 1);
        assert_eq!(out.timed_out[0].run_id, "run-a");
    }

    #[test]
    fn idle_runs_are_not_swept() {
        let mut ledger = TestLedger::at("2025-01-01T00:00:00Z");
        ledger.dispatch(&two_agent_template(), "run-1");
        let out = sweep(
            &mut ledger.journal,
            at("2025-02-01T00:00:00Z"),
            Duration::from_secs(1),
            None,
        )
        .expect("sweep");
        assert!(out.timed_out.is_empty());
    }
}
