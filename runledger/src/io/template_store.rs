//! Template loading: JSON/YAML documents, merge patches, validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::template::{Playbook, merge_patch};
use crate::io::schema::{self, Document};

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Read a JSON or YAML document, chosen by file extension.
pub fn read_document(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&contents).with_context(|| format!("parse yaml {}", path.display()))
        }
        Some("json") => {
            serde_json::from_str(&contents).with_context(|| format!("parse json {}", path.display()))
        }
        other => Err(anyhow!(
            "unsupported template format {:?} for {} (expected .json, .yaml or .yml)",
            other.unwrap_or(""),
            path.display()
        )),
    }
}

/// Apply `patches` in order to `document`, then validate it into a playbook.
pub fn build_playbook(mut document: Value, patches: &[Value]) -> Result<Playbook> {
    for patch in patches {
        merge_patch(&mut document, patch);
    }
    schema::validate(Document::Template, &document)?;
    let playbook = Playbook::from_value(document)?;
    Ok(playbook)
}

/// Load a template file plus patch files.
#[instrument(skip_all, fields(template = %path.display(), patches = patches.len()))]
pub fn load_playbook(path: &Path, patches: &[PathBuf]) -> Result<Playbook> {
    let document = read_document(path)?;
    let patches = patches
        .iter()
        .map(|p| read_document(p))
        .collect::<Result<Vec<_>>>()?;
    let playbook = build_playbook(document, &patches)
        .with_context(|| format!("load template {}", path.display()))?;
    debug!(
        template_id = %playbook.template.template_id,
        digest = %playbook.digest,
        "template loaded"
    );
    Ok(playbook)
}

/// Resolve a template reference to a file.
///
/// A reference is a path (absolute, or relative to `root`) or a bare name
/// looked up as `<templates_dir>/<name>.{json,yaml,yml}`.
pub fn resolve_template_path(root: &Path, templates_dir: &Path, reference: &str) -> Result<PathBuf> {
    let direct = root.join(reference);
    if direct.is_file() {
        return Ok(direct);
    }
    let dir = root.join(templates_dir);
    for ext in EXTENSIONS {
        let candidate = dir.join(format!("{reference}.{ext}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "template '{reference}' not found (looked in {} and {})",
        root.display(),
        dir.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::TemplateError;
    use serde_json::json;

    const YAML_TEMPLATE: &str = "\
template_id: feature
version: 3
steps:
  - step_id: plan
    type: agent
    agent:
      profile: planner
  - step_id: review
    type: human
";

    #[test]
    fn loads_yaml_with_json_patch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("feature.yaml");
        let patch = temp.path().join("patch.json");
        fs::write(&template, YAML_TEMPLATE).expect("write");
        fs::write(
            &patch,
            json!({"steps": [{"step_id": "review", "breakpoint": {"enabled": true}}]}).to_string(),
        )
        .expect("write");

        let playbook = load_playbook(&template, &[patch]).expect("load");
        assert_eq!(playbook.template.version, "3");
        assert_eq!(playbook.steps().len(), 2);
        assert!(playbook.step("review").expect("review").breakpoint_enabled());
        assert_eq!(playbook.step("plan").expect("plan").profile(), Some("planner"));
    }

    #[test]
    fn patch_changes_the_digest() {
        let doc = json!({
            "template_id": "t", "version": "1",
            "steps": [{"step_id": "a", "type": "agent"}]
        });
        let plain = build_playbook(doc.clone(), &[]).expect("plain");
        let patched =
            build_playbook(doc, &[json!({"title": "patched"})]).expect("patched");
        assert_ne!(plain.digest, patched.digest);
    }

    #[test]
    fn semantic_problems_surface_as_template_errors() {
        let doc = json!({
            "template_id": "t", "version": "1",
            "steps": [{"step_id": "a", "type": "agent"}, {"step_id": "a", "type": "human"}]
        });
        let err = build_playbook(doc, &[]).unwrap_err();
        match err.downcast_ref::<TemplateError>() {
            Some(TemplateError::Invalid(problems)) => {
                assert!(problems.iter().any(|p| p.contains("duplicate step_id")));
            }
            other => panic!("expected invalid template, got {other:?}"),
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feature.toml");
        fs::write(&path, "template_id = 't'").expect("write");
        assert!(read_document(&path).unwrap_err().to_string().contains("unsupported"));
    }

    #[test]
    fn resolves_bare_names_in_templates_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(".runledger/templates");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("feature.yml"), YAML_TEMPLATE).expect("write");
        let found = resolve_template_path(temp.path(), Path::new(".runledger/templates"), "feature")
            .expect("resolve");
        assert_eq!(found, dir.join("feature.yml"));
        assert!(
            resolve_template_path(temp.path(), Path::new(".runledger/templates"), "missing")
                .is_err()
        );
    }
}
