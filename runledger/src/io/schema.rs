//! JSON Schemas for every document that crosses a process boundary.
//!
//! The schemas ship inside the binary; a hook author can read them from
//! `runledger/schemas/`.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Event,
    HookInput,
    HookOutput,
    EvidenceInput,
    EvidenceOutput,
    Plan,
    Template,
}

impl Document {
    pub const ALL: [Document; 7] = [
        Document::Event,
        Document::HookInput,
        Document::HookOutput,
        Document::EvidenceInput,
        Document::EvidenceOutput,
        Document::Plan,
        Document::Template,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Document::Event => "event",
            Document::HookInput => "hook input",
            Document::HookOutput => "hook output",
            Document::EvidenceInput => "evidence input",
            Document::EvidenceOutput => "evidence output",
            Document::Plan => "plan",
            Document::Template => "template",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Document::Event => include_str!("../../schemas/event.schema.json"),
            Document::HookInput => include_str!("../../schemas/hook_input.schema.json"),
            Document::HookOutput => include_str!("../../schemas/hook_output.schema.json"),
            Document::EvidenceInput => include_str!("../../schemas/evidence_input.schema.json"),
            Document::EvidenceOutput => {
                include_str!("../../schemas/evidence_output.schema.json")
            }
            Document::Plan => include_str!("../../schemas/plan.schema.json"),
            Document::Template => include_str!("../../schemas/template.schema.json"),
        }
    }
}

static VALIDATORS: LazyLock<HashMap<Document, Result<Validator, String>>> = LazyLock::new(|| {
    Document::ALL
        .into_iter()
        .map(|doc| (doc, compile(doc).map_err(|err| format!("{err:#}"))))
        .collect()
});

fn compile(doc: Document) -> Result<Validator> {
    let schema: Value = serde_json::from_str(doc.source())
        .map_err(|err| anyhow!("parse {} schema: {err}", doc.name()))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile {} schema: {err}", doc.name()))
}

/// Every violation of `doc`'s schema; empty when `instance` is valid.
pub fn violations(doc: Document, instance: &Value) -> Vec<String> {
    match VALIDATORS.get(&doc) {
        Some(Ok(validator)) => validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect(),
        Some(Err(err)) => vec![err.clone()],
        None => vec![format!("no schema registered for {}", doc.name())],
    }
}

/// Validate `instance`, folding all violations into one error.
pub fn validate(doc: Document, instance: &Value) -> Result<()> {
    let messages = violations(doc, instance);
    if messages.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "{} schema validation failed: {}",
        doc.name(),
        messages.join("; ")
    ))
}
