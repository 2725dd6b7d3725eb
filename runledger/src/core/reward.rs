//! Reward scoring: turn evidence into a weighted report and a decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::template::{Scoring, Severity, SignalConfig, Step, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Redo,
    EscalateBp,
    Fail,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Redo => "redo",
            Decision::EscalateBp => "escalate_bp",
            Decision::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub pass_fail: Verdict,
    pub score: f64,
    pub severity: Severity,
    /// Evidence ids the result was computed from.
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardReport {
    pub reward_total: f64,
    pub pass_threshold: f64,
    pub decision: Decision,
    pub signals: BTreeMap<String, SignalResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// One record written by an evidence producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub kind: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Everything a producer returned for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvidence {
    pub ok: bool,
    #[serde(default)]
    pub records: Vec<EvidenceRecord>,
}

/// Score a reward step against the evidence gathered for its signals.
///
/// A declared signal without evidence scores 0 and is treated as a failing
/// HARD signal, so the step can never pass on missing data.
pub fn score(
    template: &Template,
    step: &Step,
    evidence: &BTreeMap<String, SignalEvidence>,
) -> RewardReport {
    let Some(reward) = &step.reward else {
        return RewardReport {
            reward_total: 0.0,
            pass_threshold: 1.0,
            decision: Decision::Fail,
            signals: BTreeMap::new(),
            notes: vec![format!("step '{}' has no reward block", step.step_id)],
        };
    };

    let mut signals = BTreeMap::new();
    let mut notes = Vec::new();
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut hard_failure = false;

    for signal_id in &reward.signals {
        let config = template.signals.get(signal_id);
        let weight = config.map_or(0.0, |c| c.weight);
        weight_sum += weight;

        let result = match (config, evidence.get(signal_id)) {
            (Some(config), Some(found)) => score_signal(config, found),
            _ => {
                notes.push(format!("missing evidence for signal '{signal_id}'"));
                SignalResult {
                    pass_fail: Verdict::Fail,
                    score: 0.0,
                    severity: Severity::Hard,
                    evidence: Vec::new(),
                    summary: "missing evidence".to_string(),
                }
            }
        };

        if result.pass_fail == Verdict::Fail && result.severity == Severity::Hard {
            hard_failure = true;
        }
        weighted += weight * result.score;
        signals.insert(signal_id.clone(), result);
    }

    let reward_total = if weight_sum > 0.0 {
        (weighted / weight_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let thresholds = &reward.thresholds;
    let decision = if hard_failure {
        notes.push("hard signal failed".to_string());
        Decision::Fail
    } else if reward_total >= thresholds.pass {
        Decision::Pass
    } else if thresholds.escalate.is_some_and(|e| reward_total >= e) {
        Decision::EscalateBp
    } else {
        Decision::Redo
    };

    RewardReport {
        reward_total,
        pass_threshold: thresholds.pass,
        decision,
        signals,
        notes,
    }
}

fn score_signal(config: &SignalConfig, found: &SignalEvidence) -> SignalResult {
    let evidence = found
        .records
        .iter()
        .map(|r| r.evidence_id.clone())
        .collect();
    let summaries: Vec<&str> = found
        .records
        .iter()
        .filter_map(|r| r.summary.as_deref())
        .collect();

    let (passed, score, summary) = match &config.scoring {
        Scoring::PassFail => {
            let failures: f64 = found
                .records
                .iter()
                .filter_map(|r| r.metrics.get("failures").and_then(Value::as_f64))
                .sum();
            let passed = found.ok && failures == 0.0;
            let summary = if !found.ok {
                "producer reported failure".to_string()
            } else if failures > 0.0 {
                format!("{failures} failure(s)")
            } else {
                "passed".to_string()
            };
            (passed, if passed { 1.0 } else { 0.0 }, summary)
        }
        Scoring::DiffRatio {
            threshold,
            pass_if_lte,
        } => {
            let ratio = found
                .records
                .iter()
                .filter_map(|r| r.metrics.get("ratio").and_then(Value::as_f64))
                .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
            match ratio {
                Some(ratio) => {
                    let score = (1.0 - ratio / threshold).clamp(0.0, 1.0);
                    let passed = found.ok && ratio <= *pass_if_lte;
                    (passed, score, format!("ratio {ratio}"))
                }
                None => (false, 0.0, "no ratio metric".to_string()),
            }
        }
    };

    let summary = if summaries.is_empty() {
        summary
    } else {
        format!("{summary}: {}", summaries.join("; "))
    };
    SignalResult {
        pass_fail: if passed { Verdict::Pass } else { Verdict::Fail },
        score,
        severity: config.severity,
        evidence,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::Playbook;
    use serde_json::json;

    fn playbook() -> Playbook {
        Playbook::from_value(json!({
            "template_id": "t",
            "version": "1",
            "steps": [{
                "step_id": "grade",
                "type": "reward",
                "reward": {
                    "signals": ["tests", "diff", "lint"],
                    "thresholds": {"pass": 0.8, "escalate": 0.5}
                }
            }],
            "signals": {
                "tests": {"weight": 2, "severity": "HARD"},
                "diff": {"weight": 1, "scoring": {"mode": "diff_ratio", "threshold": 0.5, "pass_if_lte": 0.2}},
                "lint": {"weight": 1}
            }
        }))
        .expect("valid")
    }

    fn record(id: &str, metrics: Value) -> EvidenceRecord {
        EvidenceRecord {
            evidence_id: id.to_string(),
            kind: "metric".to_string(),
            paths: Vec::new(),
            metrics: metrics.as_object().cloned().unwrap_or_default(),
            summary: None,
        }
    }

    fn evidence(tests_failures: u32, ratio: f64, lint_ok: bool) -> BTreeMap<String, SignalEvidence> {
        BTreeMap::from([
            (
                "tests".to_string(),
                SignalEvidence {
                    ok: true,
                    records: vec![record("ev-tests", json!({"failures": tests_failures}))],
                },
            ),
            (
                "diff".to_string(),
                SignalEvidence {
                    ok: true,
                    records: vec![record("ev-diff", json!({"ratio": ratio}))],
                },
            ),
            (
                "lint".to_string(),
                SignalEvidence {
                    ok: lint_ok,
                    records: Vec::new(),
                },
            ),
        ])
    }

    fn grade(evidence: &BTreeMap<String, SignalEvidence>) -> RewardReport {
        let playbook = playbook();
        let step = playbook.step("grade").expect("grade step");
        score(&playbook.template, step, evidence)
    }

    #[test]
    fn all_signals_passing_yields_pass() {
        let report = grade(&evidence(0, 0.0, true));
        assert_eq!(report.decision, Decision::Pass);
        assert!((report.reward_total - 1.0).abs() < 1e-9);
        assert_eq!(report.signals["tests"].evidence, vec!["ev-tests".to_string()]);
    }

    #[test]
    fn hard_failure_overrides_total() {
        let report = grade(&evidence(2, 0.0, true));
        assert_eq!(report.signals["tests"].pass_fail, Verdict::Fail);
        assert_eq!(report.decision, Decision::Fail);
    }

    #[test]
    fn soft_shortfall_lands_in_escalation_band() {
        // tests 2*1 + diff 1*0.2 (ratio 0.4 of 0.5) + lint 0 => 2.2 / 4 = 0.55
        let report = grade(&evidence(0, 0.4, false));
        assert!((report.reward_total - 0.55).abs() < 1e-9);
        assert_eq!(report.signals["diff"].pass_fail, Verdict::Fail);
        assert_eq!(report.decision, Decision::EscalateBp);
    }

    #[test]
    fn below_escalation_band_redoes() {
        let ev = evidence(0, 0.5, false);
        let playbook = Playbook::from_value(json!({
            "template_id": "t",
            "version": "1",
            "steps": [{
                "step_id": "grade",
                "type": "reward",
                "reward": {"signals": ["tests", "lint"], "thresholds": {"pass": 0.9, "escalate": 0.6}}
            }],
            "signals": {"tests": {"weight": 1}, "lint": {"weight": 1}}
        }))
        .expect("valid");
        let step = playbook.step("grade").expect("grade");
        let report = score(&playbook.template, step, &ev);
        assert!((report.reward_total - 0.5).abs() < 1e-9);
        assert_eq!(report.decision, Decision::Redo);
    }

    #[test]
    fn missing_evidence_is_a_hard_failure() {
        let mut ev = evidence(0, 0.0, true);
        ev.remove("lint");
        let report = grade(&ev);
        assert_eq!(report.signals["lint"].severity, Severity::Hard);
        assert_eq!(report.decision, Decision::Fail);
        assert!(report.notes.iter().any(|n| n.contains("lint")));
    }

    #[test]
    fn decision_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Decision::EscalateBp).expect("serialize"),
            json!("escalate_bp")
        );
    }
}
