//! Append-only event journal backed by files under `.runledger/`.
//!
//! Layout:
//! - `runs/<run_id>/{seq:06}--{kind}--{step|_}--{attempt}--{actor}.json`
//! - `entities/<entity>/{hlc}--{actor}--{nonce}--{kind}.md`
//!
//! A record is never rewritten. Appends land through a temp file that is
//! hard-linked into place, so an existing path is never clobbered and a
//! reader never sees a half-written record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::event::{
    Dispatched, EVENT_SCHEMA, Event, RunEvent, parse_markdown_event, render_markdown_event,
};
use crate::core::event_path::{
    EntityEventName, RunEventName, compare_entity_event_names, compare_run_event_names,
    validate_id,
};
use crate::core::template::Playbook;
use crate::io::clock::{HlcClock, new_nonce};
use crate::io::config::LEDGER_DIR;
use crate::io::git::Git;
use crate::io::schema::{self, Document};

#[derive(Debug, Error)]
pub enum JournalError {
    /// Another writer already holds this record path.
    #[error("journal record already exists: {}", .0.display())]
    Conflict(PathBuf),
}

/// Append/read access to run journals.
pub trait Journal {
    /// Append one run event; returns the record path.
    fn append(&mut self, run_id: &str, event: &RunEvent) -> Result<PathBuf>;
    /// All events of a run in journal order.
    fn read(&self, run_id: &str) -> Result<Vec<Event>>;
    /// Every run id with a journal directory.
    fn list_runs(&self) -> Result<Vec<String>>;
    /// Fresh ULID for a new run.
    fn new_id(&self) -> String;
}

/// A run's journal together with the template it was dispatched with.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub playbook: Playbook,
    pub dispatched: Dispatched,
    pub events: Vec<Event>,
}

/// Read a run and rebuild its playbook from `run.dispatched`.
pub fn load_run(journal: &dyn Journal, run_id: &str) -> Result<RunRecord> {
    let events = journal.read(run_id)?;
    let dispatched = events
        .iter()
        .find_map(|e| match e.run_event() {
            Ok(Some(RunEvent::Dispatched(d))) => Some(d),
            _ => None,
        })
        .ok_or_else(|| anyhow!("run '{run_id}' has no run.dispatched event"))?;
    let playbook = Playbook::from_value(dispatched.template.clone())
        .with_context(|| format!("template embedded in run '{run_id}'"))?;
    Ok(RunRecord {
        run_id: run_id.to_string(),
        playbook,
        dispatched,
        events,
    })
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(LEDGER_DIR).join("runs")
}

pub fn entities_dir(root: &Path) -> PathBuf {
    root.join(LEDGER_DIR).join("entities")
}

/// Filesystem journal; optionally commits each record to git.
#[derive(Debug)]
pub struct FsJournal {
    root: PathBuf,
    actor: String,
    clock: HlcClock,
    git: Option<Git>,
}

impl FsJournal {
    pub fn new(root: impl Into<PathBuf>, actor: &str, clock: HlcClock) -> Result<FsJournal> {
        validate_id("actor", actor)?;
        Ok(FsJournal {
            root: root.into(),
            actor: actor.to_string(),
            clock,
            git: None,
        })
    }

    /// Commit every appended record to the git repository at the root.
    pub fn with_git_commits(mut self) -> Result<FsJournal> {
        let git = Git::new(&self.root);
        if !git.is_repo() {
            return Err(anyhow!(
                "journal.commit is enabled but {} is not a git work tree",
                self.root.display()
            ));
        }
        self.git = Some(git);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    fn envelope(&mut self, kind: &str, payload: Value) -> Result<Event> {
        let stamp = self.clock.tick()?;
        Ok(Event {
            schema: EVENT_SCHEMA.to_string(),
            kind: kind.to_string(),
            id: self.clock.new_id(),
            time: stamp.rfc3339(),
            actor: self.actor.clone(),
            payload,
        })
    }

    fn next_seq(dir: &Path) -> Result<u64> {
        if !dir.exists() {
            return Ok(1);
        }
        let mut max = 0;
        for name in list_file_names(dir)? {
            if let Ok(parsed) = RunEventName::parse(&name) {
                max = max.max(parsed.seq);
            }
        }
        Ok(max + 1)
    }

    fn commit(&self, path: &Path, message: &str) -> Result<()> {
        if let Some(git) = &self.git {
            git.commit_paths(&[path], message)
                .with_context(|| format!("commit {}", path.display()))?;
        }
        Ok(())
    }

    /// Append an issue/PR event; `body` becomes the Markdown body.
    #[instrument(skip_all, fields(entity, kind))]
    pub fn append_entity(
        &mut self,
        entity: &str,
        kind: &str,
        payload: Value,
        body: Option<&str>,
    ) -> Result<PathBuf> {
        validate_id("entity", entity)?;
        let dir = entities_dir(&self.root).join(entity);
        if let Some(latest) = self.latest_entity_stamp(&dir)? {
            self.clock.observe(latest)?;
        }
        let mut event = self.envelope(kind, payload)?;
        if let Some(body) = body
            && let Value::Object(map) = &mut event.payload
        {
            map.insert("body".to_string(), Value::String(body.to_string()));
        }
        let stamp = self
            .clock
            .last()
            .ok_or_else(|| anyhow!("clock produced no stamp"))?;
        let name = EntityEventName {
            stamp,
            actor: self.actor.clone(),
            nonce: new_nonce(),
            kind: kind.to_string(),
        }
        .render();
        let path = dir.join(name);
        let contents = render_markdown_event(&event)?;
        write_new(&path, contents.as_bytes())?;
        debug!(path = %path.display(), "entity event appended");
        self.commit(&path, &format!("ledger: {entity} {kind}"))?;
        Ok(path)
    }

    /// All events of an entity ordered by `(time, actor, nonce)`.
    pub fn read_entity(&self, entity: &str) -> Result<Vec<Event>> {
        validate_id("entity", entity)?;
        let dir = entities_dir(&self.root).join(entity);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = list_file_names(&dir)?;
        names.retain(|n| EntityEventName::parse(n).is_ok());
        names.sort_by(|a, b| compare_entity_event_names(a, b));
        names.iter().map(|n| read_record(&dir.join(n))).collect()
    }

    fn latest_entity_stamp(&self, dir: &Path) -> Result<Option<crate::core::hlc::Hlc>> {
        if !dir.exists() {
            return Ok(None);
        }
        Ok(list_file_names(dir)?
            .iter()
            .filter_map(|n| EntityEventName::parse(n).ok())
            .map(|n| n.stamp)
            .max())
    }
}

impl Journal for FsJournal {
    #[instrument(skip_all, fields(run_id, kind = event.kind()))]
    fn append(&mut self, run_id: &str, event: &RunEvent) -> Result<PathBuf> {
        validate_id("run_id", run_id)?;
        let (step_id, attempt) = event.step_coordinates();
        if let Some(step_id) = step_id {
            validate_id("step_id", step_id)?;
        }
        let dir = runs_dir(&self.root).join(run_id);
        let name = RunEventName {
            seq: Self::next_seq(&dir)?,
            kind: event.kind().to_string(),
            step_id: step_id.map(str::to_string),
            attempt,
            actor: self.actor.clone(),
        };
        let envelope = self.envelope(event.kind(), event.payload()?)?;
        let path = dir.join(name.render());
        let mut buf = serde_json::to_vec_pretty(&envelope).context("serialize event")?;
        buf.push(b'\n');
        write_new(&path, &buf)?;
        debug!(path = %path.display(), "run event appended");
        self.commit(&path, &format!("ledger: {run_id} {}", event.kind()))?;
        Ok(path)
    }

    fn read(&self, run_id: &str) -> Result<Vec<Event>> {
        validate_id("run_id", run_id)?;
        let dir = runs_dir(&self.root).join(run_id);
        if !dir.exists() {
            return Err(anyhow!("unknown run '{run_id}'"));
        }
        let mut names = list_file_names(&dir)?;
        names.retain(|n| {
            let ok = RunEventName::parse(n).is_ok();
            if !ok {
                warn!(file = %n, "skipping file that is not a run event");
            }
            ok
        });
        names.sort_by(|a, b| compare_run_event_names(a, b));
        let mut events = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            let event = read_record(&path)?;
            // Known kinds must decode; unknown kinds are carried and ignored.
            event
                .run_event()
                .with_context(|| format!("decode {}", path.display()))?;
            events.push(event);
        }
        Ok(events)
    }

    fn list_runs(&self) -> Result<Vec<String>> {
        let dir = runs_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn new_id(&self) -> String {
        self.clock.new_id()
    }
}

fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Read a JSON or Markdown record.
pub fn read_record(path: &Path) -> Result<Event> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read record {}", path.display()))?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("md") => parse_markdown_event(&contents)
            .and_then(|event| serde_json::to_value(event).context("serialize event")),
        _ => serde_json::from_str(&contents).context("parse event json"),
    }
    .with_context(|| format!("parse record {}", path.display()))?;
    schema::validate(Document::Event, &value)
        .with_context(|| format!("validate record {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("decode record {}", path.display()))
}

/// Create `path` with `contents`, failing if it already exists.
fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp record in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, contents).context("write temp record")?;
    match fs::hard_link(tmp.path(), path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(JournalError::Conflict(path.to_path_buf()).into())
        }
        Err(err) => Err(err).with_context(|| format!("link record {}", path.display())),
    }
}
