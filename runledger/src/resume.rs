//! Orchestration for `runledger run resume` and `run complete-step`.

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::event::{HumanResumed, RunEvent, WaitReason};
use crate::core::state::RunStatus;
use crate::io::journal::Journal;
use crate::reconcile::derive_run;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub run_id: String,
    /// Whether the run was waiting on a human when resumed.
    pub was_waiting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<WaitReason>,
    pub status: RunStatus,
}

/// Append `run.human.resumed`.
///
/// The record is written whatever the run is doing, with the message as
/// given. The fold ignores it when nothing is waiting or the run is over,
/// so a stray resume never moves a run.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn resume(journal: &mut dyn Journal, run_id: &str, message: &str) -> Result<ResumeOutcome> {
    let message = message.trim();
    let (_, before) = derive_run(journal, run_id)?;
    let reason = before.waiting.as_ref().map(|w| w.reason);
    if before.status.is_terminal() {
        warn!(status = ?before.status, "run is finished; resume recorded without effect");
    } else if reason.is_none() {
        warn!("run is not waiting; resume recorded without effect");
    }

    journal.append(
        run_id,
        &RunEvent::HumanResumed(HumanResumed {
            message: message.to_string(),
        }),
    )?;
    let (_, after) = derive_run(journal, run_id)?;
    info!(reason = ?reason, status = ?after.status, "run resumed");
    Ok(ResumeOutcome {
        run_id: run_id.to_string(),
        was_waiting: reason.is_some(),
        reason,
        status: after.status,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteStepOutcome {
    pub run_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub status: RunStatus,
}

/// Mark the current attempt completed by hand.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn complete_step(
    journal: &mut dyn Journal,
    run_id: &str,
    summary: Option<&str>,
) -> Result<CompleteStepOutcome> {
    let (_, state) = derive_run(journal, run_id)?;
    if state.status.is_terminal() {
        bail!("run '{run_id}' is {:?}", state.status);
    }
    if let Some(waiting) = &state.waiting {
        bail!(
            "run '{run_id}' is waiting ({:?}): {}; resume it first",
            waiting.reason,
            waiting.message
        );
    }
    let step_id = state
        .current
        .step_id
        .clone()
        .ok_or_else(|| anyhow!("run '{run_id}' has no current step"))?;
    let attempt = state.current.attempt;

    journal.append(
        run_id,
        &RunEvent::completed(&step_id, attempt, summary.map(str::to_string)),
    )?;
    let (_, after) = derive_run(journal, run_id)?;
    info!(step_id = %step_id, attempt, "step completed manually");
    Ok(CompleteStepOutcome {
        run_id: run_id.to_string(),
        step_id,
        attempt,
        status: after.status,
    })
}
