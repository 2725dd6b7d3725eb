//! Engine configuration stored under `.runledger/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::event_path::validate_id;
use crate::core::plan::HookResolver;
use crate::core::template::StepType;

/// Directory under the repository root that holds every ledger file.
pub const LEDGER_DIR: &str = ".runledger";

/// Engine configuration (TOML).
///
/// Meant to be edited by humans. Missing fields default to values that work
/// for a local checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Actor identity stamped on every event this process writes.
    pub actor: String,

    /// Fixed RFC3339 "now" used instead of the wall clock (deterministic runs).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,

    /// Where `template validate`/`run dispatch` resolve relative template ids.
    pub templates_dir: PathBuf,

    pub exec: ExecConfig,
    pub journal: JournalConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvalidOutputPolicy {
    /// Leave the attempt unresolved so it can be re-planned.
    #[default]
    Inconclusive,
    /// Record `run.step.failed` with reason `invalid_output`.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Interval between `run.step.heartbeat` events while a hook runs.
    pub heartbeat_interval_ms: u64,
    /// Sweep converts attempts idle for longer than this into human waits.
    pub step_idle_timeout_secs: u64,
    /// Hard bound on a single hook invocation.
    pub hook_timeout_secs: u64,
    /// Truncate captured hook stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Validate hook input/output documents against their JSON Schemas.
    pub validate_hook_io: bool,
    pub invalid_output: InvalidOutputPolicy,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            step_idle_timeout_secs: 15 * 60,
            hook_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            validate_hook_io: true,
            invalid_output: InvalidOutputPolicy::Inconclusive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// `git add` + `git commit` every appended event.
    pub commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HooksConfig {
    /// Hook name per step type (`agent`, `human`, `reward`).
    pub defaults: BTreeMap<String, String>,
    /// Hook name per agent profile; wins over `defaults`.
    pub profiles: BTreeMap<String, String>,
    /// Command line per hook name. Only hooks listed here can run.
    pub commands: BTreeMap<String, Vec<String>>,
}

impl HooksConfig {
    /// Registered command line for a hook name.
    pub fn command_for(&self, hook: &str) -> Result<&[String]> {
        self.commands
            .get(hook)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("hook '{hook}' is not registered in [hooks.commands]"))
    }
}

impl HookResolver for HooksConfig {
    fn resolve(&self, step_type: StepType, profile: Option<&str>) -> String {
        profile
            .and_then(|p| self.profiles.get(p))
            .or_else(|| self.defaults.get(step_type.as_str()))
            .cloned()
            .unwrap_or_else(|| step_type.as_str().to_string())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            actor: "local".to_string(),
            now: None,
            templates_dir: PathBuf::from(".runledger/templates"),
            exec: ExecConfig::default(),
            journal: JournalConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        validate_id("actor", &self.actor)?;
        if let Some(now) = &self.now {
            chrono::DateTime::parse_from_rfc3339(now)
                .with_context(|| format!("now must be RFC3339 (got '{now}')"))?;
        }
        if self.exec.heartbeat_interval_ms == 0 {
            return Err(anyhow!("exec.heartbeat_interval_ms must be > 0"));
        }
        if self.exec.step_idle_timeout_secs == 0 {
            return Err(anyhow!("exec.step_idle_timeout_secs must be > 0"));
        }
        if self.exec.hook_timeout_secs == 0 {
            return Err(anyhow!("exec.hook_timeout_secs must be > 0"));
        }
        if self.exec.output_limit_bytes == 0 {
            return Err(anyhow!("exec.output_limit_bytes must be > 0"));
        }
        for (hook, command) in &self.hooks.commands {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("hooks.commands.{hook} must be a non-empty array"));
            }
        }
        Ok(())
    }

    /// Overlay process environment tunables onto the loaded file.
    ///
    /// This is the only place the engine reads the environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(actor) = lookup("RUNLEDGER_ACTOR") {
            self.actor = actor;
        }
        if let Some(now) = lookup("RUNLEDGER_NOW") {
            self.now = Some(now);
        }
        if let Some(ms) = lookup("RUNLEDGER_HEARTBEAT_MS") {
            self.exec.heartbeat_interval_ms = ms
                .parse()
                .with_context(|| format!("RUNLEDGER_HEARTBEAT_MS must be an integer (got '{ms}')"))?;
        }
        if let Some(secs) = lookup("RUNLEDGER_STEP_IDLE_TIMEOUT_SECS") {
            self.exec.step_idle_timeout_secs = secs.parse().with_context(|| {
                format!("RUNLEDGER_STEP_IDLE_TIMEOUT_SECS must be an integer (got '{secs}')")
            })?;
        }
        if let Some(flag) = lookup("RUNLEDGER_VALIDATE_HOOK_IO") {
            self.exec.validate_hook_io = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(anyhow!(
                        "RUNLEDGER_VALIDATE_HOOK_IO must be a boolean (got '{other}')"
                    ));
                }
            };
        }
        Ok(())
    }
}

/// Path of the config file under a repository root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(LEDGER_DIR).join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write `contents` to `path` through a uniquely named sibling temp file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, contents)
        .with_context(|| format!("write temp file {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn write_atomic_replaces_without_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("hlc.json");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");

        let names: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, ["hlc.json"]);
    }

    #[test]
    fn concurrent_atomic_writes_never_tear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("hlc.json");
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let body = format!("writer-{i}-").repeat(512);
                    for _ in 0..20 {
                        write_atomic(&path, body.as_bytes()).expect("write");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("join");
        }
        let body = fs::read_to_string(&path).expect("read");
        let first = body.split('-').take(2).collect::<Vec<_>>().join("-");
        assert_eq!(body, format!("{first}-").repeat(512));
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 1);
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let mut cfg = EngineConfig::default();
        cfg.actor = "ci-bot".to_string();
        cfg.exec.invalid_output = InvalidOutputPolicy::Fail;
        cfg.hooks
            .commands
            .insert("agent".to_string(), vec!["./hooks/agent.sh".to_string()]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "actor = \"amy\"\n[exec]\nheartbeat_interval_ms = 50\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.actor, "amy");
        assert_eq!(cfg.exec.heartbeat_interval_ms, 50);
        assert_eq!(cfg.exec.step_idle_timeout_secs, 15 * 60);
        assert!(cfg.exec.validate_hook_io);
    }

    #[test]
    fn rejects_bad_actor() {
        let cfg = EngineConfig {
            actor: "a--b".to_string(),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overlay_maps_tunables() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RUNLEDGER_ACTOR", "sweeper"),
            ("RUNLEDGER_NOW", "2025-03-01T00:00:00Z"),
            ("RUNLEDGER_HEARTBEAT_MS", "250"),
            ("RUNLEDGER_VALIDATE_HOOK_IO", "off"),
        ]);
        let mut cfg = EngineConfig::default();
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("apply env");
        assert_eq!(cfg.actor, "sweeper");
        assert_eq!(cfg.now.as_deref(), Some("2025-03-01T00:00:00Z"));
        assert_eq!(cfg.exec.heartbeat_interval_ms, 250);
        assert!(!cfg.exec.validate_hook_io);
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overlay_rejects_garbage() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_env(|key| (key == "RUNLEDGER_HEARTBEAT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RUNLEDGER_HEARTBEAT_MS"));
    }

    #[test]
    fn resolver_prefers_profile_then_type_default() {
        let mut hooks = HooksConfig::default();
        hooks
            .defaults
            .insert("agent".to_string(), "codex-agent".to_string());
        hooks
            .profiles
            .insert("reviewer".to_string(), "review-bot".to_string());
        assert_eq!(hooks.resolve(StepType::Agent, Some("reviewer")), "review-bot");
        assert_eq!(hooks.resolve(StepType::Agent, Some("other")), "codex-agent");
        assert_eq!(hooks.resolve(StepType::Human, None), "human");
    }

    #[test]
    fn only_registered_hooks_have_commands() {
        let mut hooks = HooksConfig::default();
        hooks
            .commands
            .insert("agent".to_string(), vec!["codex".to_string(), "run".to_string()]);
        assert_eq!(hooks.command_for("agent").expect("agent"), ["codex", "run"]);

        let err = hooks.command_for("human").unwrap_err();
        assert!(err.to_string().contains("'human' is not registered"));
        assert!(hooks.command_for("/bin/sh").is_err());
    }
}
