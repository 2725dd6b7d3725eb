//! Orchestration for `runledger run dispatch`: start a run from a template.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::event::{Dispatched, ParentRef, RunEvent};
use crate::core::event_path::validate_id;
use crate::core::template::Playbook;
use crate::io::journal::Journal;

/// Result of dispatching a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub run_id: String,
    pub template_id: String,
    pub version: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub path: PathBuf,
}

/// Append `run.dispatched` for a new run of `playbook`.
///
/// The patched template is embedded in the event so the run is always
/// derived against exactly what was dispatched. Fails if the run id is
/// already taken.
#[instrument(skip_all, fields(template_id = %playbook.template.template_id, run_id))]
pub fn dispatch_run(
    journal: &mut dyn Journal,
    playbook: &Playbook,
    run_id: Option<&str>,
    parent: Option<ParentRef>,
) -> Result<DispatchOutcome> {
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => journal.new_id(),
    };
    validate_id("run_id", &run_id)?;
    if journal.list_runs()?.contains(&run_id) {
        return Err(anyhow!("run '{run_id}' already exists"));
    }

    let event = RunEvent::Dispatched(Dispatched {
        template_id: playbook.template.template_id.clone(),
        version: playbook.template.version.clone(),
        digest: playbook.digest.clone(),
        template: playbook.document().clone(),
        parent: parent.clone(),
    });
    let path = journal.append(&run_id, &event)?;
    info!(run_id = %run_id, digest = %playbook.digest, "run dispatched");

    Ok(DispatchOutcome {
        run_id,
        template_id: playbook.template.template_id.clone(),
        version: playbook.template.version.clone(),
        digest: playbook.digest.clone(),
        parent,
        path,
    })
}
