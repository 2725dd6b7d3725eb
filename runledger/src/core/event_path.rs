//! File name grammar for journal records.
//!
//! Run events: `{seq:06}--{kind}--{step_id|_}--{attempt}--{actor}.json`.
//! Entity events: `{hlc_token}--{actor}--{nonce}--{kind}.md`.
//!
//! `--` separates components, so identifiers may contain single dashes but
//! never a double dash.

use std::cmp::Ordering;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::hlc::Hlc;

/// Placeholder for events that are not tied to a step.
const NO_STEP: &str = "_";

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("id regex"));
static RUN_EVENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{6,})--([a-z0-9._]+)--([A-Za-z0-9._-]+?)--(\d+)--([A-Za-z0-9._-]+)\.json$")
        .expect("run event regex")
});
static ENTITY_EVENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{13}\.\d{6})--([A-Za-z0-9._-]+?)--([a-z0-9]+)--([a-z0-9._]+)\.(md|json)$")
        .expect("entity event regex")
});

/// Validate an identifier used in journal paths (run ids, step ids, actors).
pub fn validate_id(label: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("{label} must not be empty"));
    }
    if !ID_RE.is_match(id) {
        return Err(anyhow!("{label} must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    if id.contains("--") {
        return Err(anyhow!("{label} must not contain '--' (got '{id}')"));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(anyhow!("{label} must not start or end with '-' (got '{id}')"));
    }
    Ok(())
}

/// Parsed run event file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEventName {
    pub seq: u64,
    pub kind: String,
    pub step_id: Option<String>,
    pub attempt: u32,
    pub actor: String,
}

impl RunEventName {
    pub fn render(&self) -> String {
        format!(
            "{:06}--{}--{}--{}--{}.json",
            self.seq,
            self.kind,
            self.step_id.as_deref().unwrap_or(NO_STEP),
            self.attempt,
            self.actor
        )
    }

    pub fn parse(file_name: &str) -> Result<RunEventName> {
        let caps = RUN_EVENT_RE
            .captures(file_name)
            .ok_or_else(|| anyhow!("not a run event file name: '{file_name}'"))?;
        let seq = caps[1]
            .parse::<u64>()
            .map_err(|_| anyhow!("invalid sequence in '{file_name}'"))?;
        let attempt = caps[4]
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid attempt in '{file_name}'"))?;
        let step_id = match &caps[3] {
            NO_STEP => None,
            other => Some(other.to_string()),
        };
        Ok(RunEventName {
            seq,
            kind: caps[2].to_string(),
            step_id,
            attempt,
            actor: caps[5].to_string(),
        })
    }
}

/// Order run event file names by sequence, breaking ties on the full name.
pub fn compare_run_event_names(a: &str, b: &str) -> Ordering {
    let seq = |name: &str| RunEventName::parse(name).map(|n| n.seq).unwrap_or(u64::MAX);
    seq(a).cmp(&seq(b)).then_with(|| a.cmp(b))
}

/// Parsed entity event file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEventName {
    pub stamp: Hlc,
    pub actor: String,
    pub nonce: String,
    pub kind: String,
}

impl EntityEventName {
    pub fn render(&self) -> String {
        format!(
            "{}--{}--{}--{}.md",
            self.stamp.token(),
            self.actor,
            self.nonce,
            self.kind
        )
    }

    pub fn parse(file_name: &str) -> Result<EntityEventName> {
        let caps = ENTITY_EVENT_RE
            .captures(file_name)
            .ok_or_else(|| anyhow!("not an entity event file name: '{file_name}'"))?;
        Ok(EntityEventName {
            stamp: Hlc::parse_token(&caps[1])?,
            actor: caps[2].to_string(),
            nonce: caps[3].to_string(),
            kind: caps[4].to_string(),
        })
    }

    fn sort_key(&self) -> (Hlc, &str, &str) {
        (self.stamp, &self.actor, &self.nonce)
    }
}

/// Order entity event file names by `(time, actor, nonce)`, then name.
pub fn compare_entity_event_names(a: &str, b: &str) -> Ordering {
    match (EntityEventName::parse(a), EntityEventName::parse(b)) {
        (Ok(left), Ok(right)) => left
            .sort_key()
            .cmp(&right.sort_key())
            .then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_event_name_round_trips_with_dashed_ids() {
        let name = RunEventName {
            seq: 12,
            kind: "run.step.exec.timed_out".to_string(),
            step_id: Some("write-tests".to_string()),
            attempt: 3,
            actor: "agent-7".to_string(),
        };
        let rendered = name.render();
        assert_eq!(
            rendered,
            "000012--run.step.exec.timed_out--write-tests--3--agent-7.json"
        );
        assert_eq!(RunEventName::parse(&rendered).expect("parse"), name);
    }

    #[test]
    fn run_event_without_step_uses_placeholder() {
        let name = RunEventName {
            seq: 1,
            kind: "run.dispatched".to_string(),
            step_id: None,
            attempt: 0,
            actor: "ci".to_string(),
        };
        assert_eq!(name.render(), "000001--run.dispatched--_--0--ci.json");
        assert_eq!(RunEventName::parse(&name.render()).expect("parse").step_id, None);
    }

    #[test]
    fn run_events_order_by_sequence_then_name() {
        let mut names = vec![
            "000010--run.step.started--a--1--bob.json",
            "000002--run.step.started--a--1--zed.json",
            "000002--run.step.started--a--1--amy.json",
        ];
        names.sort_by(|a, b| compare_run_event_names(a, b));
        assert_eq!(
            names,
            vec![
                "000002--run.step.started--a--1--amy.json",
                "000002--run.step.started--a--1--zed.json",
                "000010--run.step.started--a--1--bob.json",
            ]
        );
    }

    #[test]
    fn entity_events_order_by_stamp_actor_nonce() {
        let early = EntityEventName {
            stamp: Hlc::new(1_700_000_000_000, 0),
            actor: "zed".to_string(),
            nonce: "aaaa1111".to_string(),
            kind: "comment.created".to_string(),
        }
        .render();
        let late_a = EntityEventName {
            stamp: Hlc::new(1_700_000_000_000, 1),
            actor: "amy".to_string(),
            nonce: "zzzz0000".to_string(),
            kind: "comment.redacted".to_string(),
        }
        .render();
        let late_b = EntityEventName {
            stamp: Hlc::new(1_700_000_000_000, 1),
            actor: "bob".to_string(),
            nonce: "0000aaaa".to_string(),
            kind: "comment.created".to_string(),
        }
        .render();
        let mut names = vec![late_b.clone(), early.clone(), late_a.clone()];
        names.sort_by(|a, b| compare_entity_event_names(a, b));
        assert_eq!(names, vec![early, late_a, late_b]);
    }

    #[test]
    fn validate_id_rejects_separator_and_slashes() {
        assert!(validate_id("step id", "build").is_ok());
        assert!(validate_id("step id", "build-1.x_y").is_ok());
        assert!(validate_id("step id", "a--b").is_err());
        assert!(validate_id("step id", "a/b").is_err());
        assert!(validate_id("step id", "").is_err());
        assert!(validate_id("step id", "-lead").is_err());
    }
}
