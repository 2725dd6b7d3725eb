//! Playbook templates: the declarative step list a run executes.
//!
//! A [`Template`] is the raw document. A [`Playbook`] is a template that
//! passed load-time validation, with its guard expressions compiled and its
//! content digest computed. Everything downstream (derivation, planning,
//! scoring) works on a `Playbook`, so a broken guard or a dangling reference
//! can never surface at decision time.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::event_path::validate_id;
use crate::core::expr::{self, Expr};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("parse template: {0}")]
    Parse(String),
    #[error("invalid template: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub signals: BTreeMap<String, SignalConfig>,
    #[serde(default)]
    pub evidence_producers: BTreeMap<String, EvidenceProducer>,
    #[serde(default)]
    pub cbp: Vec<CbpRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Agent,
    Human,
    Reward,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Agent => "agent",
            StepType::Human => "human",
            StepType::Reward => "reward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// minijinja source rendered for the hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<Breakpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<RewardSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Dependencies>,
}

impl Step {
    pub fn breakpoint_enabled(&self) -> bool {
        self.breakpoint.as_ref().is_some_and(|b| b.enabled)
    }

    pub fn profile(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.profile.as_deref())
    }

    pub fn on_fail(&self) -> OnFail {
        self.reward
            .as_ref()
            .map(|r| r.policy.on_fail)
            .unwrap_or_default()
    }

    /// Step that a redo rewinds to (the step itself unless configured).
    pub fn redo_target(&self) -> &str {
        self.reward
            .as_ref()
            .and_then(|r| r.policy.redo_target_step_id.as_deref())
            .unwrap_or(&self.step_id)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.reward.as_ref().and_then(|r| r.policy.max_attempts)
    }

    pub fn awaits_dependencies(&self) -> bool {
        self.dependencies
            .as_ref()
            .is_some_and(|d| d.await_policy == AwaitPolicy::All)
    }

    pub fn allows_spawn(&self) -> bool {
        self.dependencies.as_ref().is_some_and(|d| d.allow_spawn)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardSpec {
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub policy: RewardPolicy,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardPolicy {
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redo_target_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    #[default]
    Fail,
    AutoRedo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_pass_threshold")]
    pub pass: f64,
    /// Totals in `[escalate, pass)` ask a human instead of redoing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pass: default_pass_threshold(),
            escalate: None,
        }
    }
}

fn default_pass_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub allow_spawn: bool,
    #[serde(default, rename = "await")]
    pub await_policy: AwaitPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwaitPolicy {
    #[default]
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub scoring: Scoring,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "HARD", alias = "hard")]
    Hard,
    #[default]
    #[serde(rename = "SOFT", alias = "soft")]
    Soft,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Scoring {
    #[default]
    PassFail,
    DiffRatio {
        /// Ratio at which the score degrades to zero.
        #[serde(default = "default_weight")]
        threshold: f64,
        pass_if_lte: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceProducer {
    pub hook: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CbpScope {
    #[default]
    Step,
    Run,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbpRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub when: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub scope: CbpScope,
}

/// A compiled conditional breakpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub rule: CbpRule,
    pub expr: Expr,
}

/// A validated template with compiled guards.
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub template: Template,
    /// SHA-256 (hex) of the canonical JSON of the template document.
    pub digest: String,
    document: Value,
    guards: Vec<Guard>,
}

impl Playbook {
    /// Parse, validate and compile a template document.
    pub fn from_value(value: Value) -> Result<Playbook, TemplateError> {
        let digest = digest_value(&value);
        let template = Template::deserialize(&value)
            .map_err(|err| TemplateError::Parse(err.to_string()))?;
        let (guards, problems) = validate(&template);
        if !problems.is_empty() {
            return Err(TemplateError::Invalid(problems));
        }
        Ok(Playbook {
            template,
            digest,
            document: value,
            guards,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.template.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.template.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.template.steps.iter().position(|s| s.step_id == step_id)
    }

    pub fn step_guards<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Guard> + 'a {
        self.guards.iter().filter(move |g| {
            g.rule.scope == CbpScope::Step && g.rule.step_id.as_deref() == Some(step_id)
        })
    }

    pub fn run_guards(&self) -> impl Iterator<Item = &Guard> {
        self.guards.iter().filter(|g| g.rule.scope == CbpScope::Run)
    }

    /// The document the digest was taken over (what `run.dispatched` embeds).
    pub fn document(&self) -> &Value {
        &self.document
    }
}

fn digest_value(value: &Value) -> String {
    // serde_json maps are ordered by key, so this serialization is canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn validate(template: &Template) -> (Vec<Guard>, Vec<String>) {
    let mut problems = Vec::new();
    let mut guards = Vec::new();

    if let Err(err) = validate_id("template_id", &template.template_id) {
        problems.push(err.to_string());
    }
    if template.version.trim().is_empty() {
        problems.push("version must not be empty".to_string());
    }
    if template.steps.is_empty() {
        problems.push("steps must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for step in &template.steps {
        if let Err(err) = validate_id("step_id", &step.step_id) {
            problems.push(err.to_string());
        }
        if !seen.insert(step.step_id.as_str()) {
            problems.push(format!("duplicate step_id '{}'", step.step_id));
        }
    }

    for (index, step) in template.steps.iter().enumerate() {
        validate_step(template, index, step, &mut problems);
    }

    for (signal_id, signal) in &template.signals {
        if !(signal.weight >= 0.0 && signal.weight.is_finite()) {
            problems.push(format!("signal '{signal_id}': weight must be >= 0"));
        }
        if let Scoring::DiffRatio {
            threshold,
            pass_if_lte,
        } = signal.scoring
        {
            if threshold <= 0.0 {
                problems.push(format!("signal '{signal_id}': diff_ratio threshold must be > 0"));
            }
            if pass_if_lte < 0.0 {
                problems.push(format!("signal '{signal_id}': pass_if_lte must be >= 0"));
            }
        }
    }
    for signal_id in template.evidence_producers.keys() {
        if !template.signals.contains_key(signal_id) {
            problems.push(format!("evidence producer for unknown signal '{signal_id}'"));
        }
    }

    let mut guard_ids = HashSet::new();
    for rule in &template.cbp {
        if !guard_ids.insert(rule.id.as_str()) {
            problems.push(format!("duplicate cbp id '{}'", rule.id));
        }
        match (rule.scope, rule.step_id.as_deref()) {
            (CbpScope::Step, None) => {
                problems.push(format!("cbp '{}': step scope requires step_id", rule.id));
            }
            (_, Some(step_id)) if !seen.contains(step_id) => {
                problems.push(format!("cbp '{}': unknown step_id '{step_id}'", rule.id));
            }
            _ => {}
        }
        match expr::parse(&rule.when) {
            Ok(expr) => guards.push(Guard {
                rule: rule.clone(),
                expr,
            }),
            Err(err) => problems.push(format!("cbp '{}': {err}", rule.id)),
        }
    }

    (guards, problems)
}

fn validate_step(template: &Template, index: usize, step: &Step, problems: &mut Vec<String>) {
    let id = &step.step_id;
    if let Some(reward) = &step.reward {
        if let Some(target) = &reward.policy.redo_target_step_id {
            match template.steps.iter().position(|s| &s.step_id == target) {
                None => problems.push(format!("step '{id}': unknown redo target '{target}'")),
                Some(target_index) if target_index > index => problems.push(format!(
                    "step '{id}': redo target '{target}' comes after the step"
                )),
                Some(_) => {}
            }
        }
        if reward.policy.max_attempts == Some(0) {
            problems.push(format!("step '{id}': max_attempts must be > 0"));
        }
        let thresholds = &reward.thresholds;
        if !(0.0..=1.0).contains(&thresholds.pass) {
            problems.push(format!("step '{id}': pass threshold must be in [0,1]"));
        }
        if let Some(escalate) = thresholds.escalate
            && !(0.0..=thresholds.pass).contains(&escalate)
        {
            problems.push(format!(
                "step '{id}': escalate threshold must be in [0, pass]"
            ));
        }
    }

    if step.step_type != StepType::Reward {
        return;
    }
    let Some(reward) = &step.reward else {
        problems.push(format!("reward step '{id}' must declare a reward block"));
        return;
    };
    if reward.signals.is_empty() {
        problems.push(format!("reward step '{id}' must declare at least one signal"));
    }
    let mut weight_sum = 0.0;
    for signal_id in &reward.signals {
        match template.signals.get(signal_id) {
            Some(signal) => weight_sum += signal.weight,
            None => problems.push(format!("step '{id}': unknown signal '{signal_id}'")),
        }
    }
    if !reward.signals.is_empty() && weight_sum <= 0.0 {
        problems.push(format!("step '{id}': signal weights must sum to > 0"));
    }
}

/// Apply a structural merge patch to a template document.
///
/// Objects merge recursively and `null` deletes a key. Arrays whose elements
/// are objects keyed by `step_id` or `id` merge element-wise by key (unknown
/// keys append); any other array is replaced.
pub fn merge_patch(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => merge_patch(existing, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(patch_items)) => {
            match keyed_field(base_items, patch_items) {
                Some(field) => merge_keyed(base_items, patch_items, field),
                None => *base_items = patch_items.clone(),
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn keyed_field(base: &[Value], patch: &[Value]) -> Option<&'static str> {
    ["step_id", "id"].into_iter().find(|field| {
        base.iter()
            .chain(patch.iter())
            .all(|item| item.get(*field).is_some_and(Value::is_string))
    })
}

fn merge_keyed(base: &mut Vec<Value>, patch: &[Value], field: &str) {
    for item in patch {
        let key = item.get(field).cloned();
        match base.iter_mut().find(|b| b.get(field).cloned() == key) {
            Some(existing) => merge_patch(existing, item),
            None => base.push(item.clone()),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}
