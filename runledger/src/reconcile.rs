//! Orchestration for `runledger run reconcile` and `run status`.
//!
//! Reconciling is: settle finished dependencies, re-derive, plan. It writes
//! nothing except `run.dep.completed` records, so it is safe to call from
//! any process at any time.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::event::{DepCompleted, RunEvent};
use crate::core::plan::{HookResolver, Plan, plan};
use crate::core::state::{RunState, RunStatus, derive};
use crate::io::journal::{Journal, RunRecord, load_run};

/// Derived state and next plan of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub run_id: String,
    pub state: RunState,
    /// `None` once the run is DONE or FAILED.
    pub plan: Option<Plan>,
    /// Dependent runs marked completed by this pass.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub settled: Vec<String>,
}

/// Replay a run's journal.
pub fn derive_run(journal: &dyn Journal, run_id: &str) -> Result<(RunRecord, RunState)> {
    let record = load_run(journal, run_id)?;
    let state = derive(run_id, &record.playbook, &record.events);
    Ok((record, state))
}

/// Append `run.dep.completed` for every pending dependency that reached DONE.
#[instrument(skip_all, fields(run_id = %state.run_id, pending = state.deps.pending.len()))]
pub fn settle_dependencies(journal: &mut dyn Journal, state: &RunState) -> Result<Vec<String>> {
    let mut settled = Vec::new();
    for dep_run_id in &state.deps.pending {
        let status = match derive_run(journal, dep_run_id) {
            Ok((_, dep_state)) => dep_state.status,
            Err(err) => {
                warn!(dep_run_id = %dep_run_id, err = %format!("{err:#}"), "dependency not readable yet");
                continue;
            }
        };
        debug!(dep_run_id = %dep_run_id, status = ?status, "dependency status");
        if status != RunStatus::Done {
            continue;
        }
        journal
            .append(
                &state.run_id,
                &RunEvent::DepCompleted(DepCompleted {
                    dep_run_id: dep_run_id.clone(),
                }),
            )
            .with_context(|| format!("record completion of dependency '{dep_run_id}'"))?;
        info!(dep_run_id = %dep_run_id, "dependency completed");
        settled.push(dep_run_id.clone());
    }
    Ok(settled)
}

/// Settle dependencies, then derive and plan.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn reconcile(
    journal: &mut dyn Journal,
    resolver: &dyn HookResolver,
    run_id: &str,
) -> Result<Reconciliation> {
    let (_, state) = derive_run(journal, run_id)?;
    let settled = if state.deps.pending.is_empty() || state.status.is_terminal() {
        Vec::new()
    } else {
        settle_dependencies(journal, &state)?
    };
    // Re-read so the fold sees any records just appended.
    let (record, state) = derive_run(journal, run_id)?;
    let plan = plan(&state, &record.playbook, resolver);
    debug!(status = ?state.status, plan = ?plan.as_ref().map(|p| p.kind), "reconciled");
    Ok(Reconciliation {
        run_id: run_id.to_string(),
        state,
        plan,
        settled,
    })
}
