//! Event records and the run event vocabulary.
//!
//! Every fact is an immutable [`Event`] envelope. Run events carry a typed
//! payload decoded through a kind-indexed table: unknown kinds are skipped so
//! older binaries can replay newer journals, while a known kind with a payload
//! that does not match its shape is rejected when the journal is loaded.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::reward::RewardReport;

/// Schema identifier stamped on every envelope.
pub const EVENT_SCHEMA: &str = "runledger.event/v1";

/// Envelope shared by run and entity events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub schema: String,
    pub kind: String,
    pub id: String,
    /// RFC3339 timestamp.
    pub time: String,
    pub actor: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Decode the run payload, if this is a run event kind we understand.
    pub fn run_event(&self) -> Result<Option<RunEvent>> {
        RunEvent::decode(&self.kind, &self.payload)
    }

    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.time)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}

/// Why a run is waiting on a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Breakpoint,
    Cbp,
    Timeout,
    Escalation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub run_id: String,
    pub step_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatched {
    pub template_id: String,
    pub version: String,
    pub digest: String,
    /// The fully patched template this run executes.
    pub template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub step_id: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStarted {
    pub step_id: String,
    pub attempt: u32,
    pub hook: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompleted {
    pub step_id: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailed {
    pub step_id: String,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoRequested {
    pub step_id: String,
    pub attempt: u32,
    pub target_step_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardReported {
    pub step_id: String,
    pub attempt: u32,
    pub report: RewardReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepSpawned {
    pub step_id: String,
    pub dep_run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepCompleted {
    pub dep_run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanWaiting {
    /// `None` when the run waits at finalization (run-scope guard).
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub reason: WaitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbp_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanResumed {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTimedOut {
    pub step_id: String,
    pub attempt: u32,
    /// RFC3339 time of the last heartbeat or start seen for the attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailed {
    pub reason: String,
}

/// Run event payloads, keyed by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum RunEvent {
    #[serde(rename = "run.dispatched")]
    Dispatched(Dispatched),
    #[serde(rename = "run.step.scheduled")]
    StepScheduled(StepRef),
    #[serde(rename = "run.step.started")]
    StepStarted(StepRef),
    #[serde(rename = "run.step.exec.started")]
    ExecStarted(ExecStarted),
    #[serde(rename = "run.step.heartbeat")]
    Heartbeat(StepRef),
    #[serde(rename = "run.step.completed")]
    StepCompleted(StepCompleted),
    #[serde(rename = "run.step.failed")]
    StepFailed(StepFailed),
    #[serde(rename = "run.step.redo_requested")]
    RedoRequested(RedoRequested),
    #[serde(rename = "run.reward.reported")]
    RewardReported(RewardReported),
    #[serde(rename = "run.dep.spawned")]
    DepSpawned(DepSpawned),
    #[serde(rename = "run.dep.completed")]
    DepCompleted(DepCompleted),
    #[serde(rename = "run.human.waiting")]
    HumanWaiting(HumanWaiting),
    #[serde(rename = "run.human.resumed")]
    HumanResumed(HumanResumed),
    #[serde(rename = "run.step.exec.timed_out")]
    ExecTimedOut(ExecTimedOut),
    #[serde(rename = "run.completed")]
    Completed(Map<String, Value>),
    #[serde(rename = "run.failed")]
    Failed(RunFailed),
}

/// Every run event kind this build understands.
pub const RUN_EVENT_KINDS: &[&str] = &[
    "run.dispatched",
    "run.step.scheduled",
    "run.step.started",
    "run.step.exec.started",
    "run.step.heartbeat",
    "run.step.completed",
    "run.step.failed",
    "run.step.redo_requested",
    "run.reward.reported",
    "run.dep.spawned",
    "run.dep.completed",
    "run.human.waiting",
    "run.human.resumed",
    "run.step.exec.timed_out",
    "run.completed",
    "run.failed",
];

impl RunEvent {
    /// Decode `payload` for `kind`. Unknown kinds yield `Ok(None)`.
    pub fn decode(kind: &str, payload: &Value) -> Result<Option<RunEvent>> {
        if !RUN_EVENT_KINDS.contains(&kind) {
            return Ok(None);
        }
        let mut tagged = Map::new();
        tagged.insert("kind".to_string(), Value::String(kind.to_string()));
        tagged.insert("payload".to_string(), payload.clone());
        let event = serde_json::from_value(Value::Object(tagged))
            .with_context(|| format!("decode {kind} payload"))?;
        Ok(Some(event))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Dispatched(_) => "run.dispatched",
            RunEvent::StepScheduled(_) => "run.step.scheduled",
            RunEvent::StepStarted(_) => "run.step.started",
            RunEvent::ExecStarted(_) => "run.step.exec.started",
            RunEvent::Heartbeat(_) => "run.step.heartbeat",
            RunEvent::StepCompleted(_) => "run.step.completed",
            RunEvent::StepFailed(_) => "run.step.failed",
            RunEvent::RedoRequested(_) => "run.step.redo_requested",
            RunEvent::RewardReported(_) => "run.reward.reported",
            RunEvent::DepSpawned(_) => "run.dep.spawned",
            RunEvent::DepCompleted(_) => "run.dep.completed",
            RunEvent::HumanWaiting(_) => "run.human.waiting",
            RunEvent::HumanResumed(_) => "run.human.resumed",
            RunEvent::ExecTimedOut(_) => "run.step.exec.timed_out",
            RunEvent::Completed(_) => "run.completed",
            RunEvent::Failed(_) => "run.failed",
        }
    }

    /// Payload as a JSON value (the envelope's `payload` field).
    pub fn payload(&self) -> Result<Value> {
        let tagged = serde_json::to_value(self).context("serialize run event")?;
        match tagged {
            Value::Object(mut map) => Ok(map.remove("payload").unwrap_or(Value::Null)),
            _ => Err(anyhow!("run event did not serialize to an object")),
        }
    }

    /// Step coordinates used in the journal file name (`_`/0 when absent).
    pub fn step_coordinates(&self) -> (Option<&str>, u32) {
        match self {
            RunEvent::StepScheduled(r) | RunEvent::StepStarted(r) | RunEvent::Heartbeat(r) => {
                (Some(&r.step_id), r.attempt)
            }
            RunEvent::ExecStarted(e) => (Some(&e.step_id), e.attempt),
            RunEvent::StepCompleted(e) => (Some(&e.step_id), e.attempt),
            RunEvent::StepFailed(e) => (Some(&e.step_id), e.attempt),
            RunEvent::RedoRequested(e) => (Some(&e.step_id), e.attempt),
            RunEvent::RewardReported(e) => (Some(&e.step_id), e.attempt),
            RunEvent::DepSpawned(e) => (Some(&e.step_id), 0),
            RunEvent::HumanWaiting(e) => (e.step_id.as_deref(), e.attempt),
            RunEvent::ExecTimedOut(e) => (Some(&e.step_id), e.attempt),
            RunEvent::Dispatched(_)
            | RunEvent::DepCompleted(_)
            | RunEvent::HumanResumed(_)
            | RunEvent::Completed(_)
            | RunEvent::Failed(_) => (None, 0),
        }
    }

    pub fn started(step_id: &str, attempt: u32) -> RunEvent {
        RunEvent::StepStarted(StepRef {
            step_id: step_id.to_string(),
            attempt,
        })
    }

    pub fn completed(step_id: &str, attempt: u32, summary: Option<String>) -> RunEvent {
        RunEvent::StepCompleted(StepCompleted {
            step_id: step_id.to_string(),
            attempt,
            summary,
        })
    }

    pub fn failed(step_id: &str, attempt: u32, reason: impl Into<String>) -> RunEvent {
        RunEvent::StepFailed(StepFailed {
            step_id: step_id.to_string(),
            attempt,
            reason: reason.into(),
        })
    }
}

/// Parse a Markdown record whose YAML frontmatter carries the envelope.
///
/// A non-empty body is exposed as `payload.body`.
pub fn parse_markdown_event(contents: &str) -> Result<Event> {
    let (frontmatter, body) =
        split_frontmatter(contents).ok_or_else(|| anyhow!("missing YAML frontmatter"))?;
    let mut event: Event = serde_yaml::from_str(frontmatter).context("parse event frontmatter")?;
    let body = body.trim();
    if !body.is_empty() {
        match &mut event.payload {
            Value::Object(map) => {
                map.insert("body".to_string(), Value::String(body.to_string()));
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("body".to_string(), Value::String(body.to_string()));
                event.payload = Value::Object(map);
            }
            _ => return Err(anyhow!("event payload must be a mapping when a body is present")),
        }
    }
    Ok(event)
}

/// Render an event as Markdown with YAML frontmatter.
pub fn render_markdown_event(event: &Event) -> Result<String> {
    let mut header = event.clone();
    let body = match &mut header.payload {
        Value::Object(map) => map.remove("body").and_then(|v| v.as_str().map(str::to_string)),
        _ => None,
    };
    let frontmatter = serde_yaml::to_string(&header).context("serialize event frontmatter")?;
    let mut buf = format!("---\n{frontmatter}---\n");
    if let Some(body) = body {
        buf.push('\n');
        buf.push_str(&body);
        buf.push('\n');
    }
    Ok(buf)
}

fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let rest = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end + 1];
    let after = &rest[end + 4..];
    let body = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))
        .unwrap_or(after);
    Some((frontmatter, body))
}
