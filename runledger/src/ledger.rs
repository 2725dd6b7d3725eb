//! An opened repository: resolved configuration plus its journal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::io::clock::HlcClock;
use crate::io::config::{EngineConfig, config_path, load_config};
use crate::io::journal::FsJournal;

#[derive(Debug)]
pub struct Ledger {
    pub root: PathBuf,
    pub config: EngineConfig,
    pub journal: FsJournal,
}

impl Ledger {
    /// Open `root`, layering `.runledger/config.toml`, the environment (via
    /// `lookup`) and an explicit `--actor`, in that order.
    pub fn open<F>(root: &Path, actor: Option<&str>, lookup: F) -> Result<Ledger>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = load_config(&config_path(root))?;
        config.apply_env(lookup)?;
        if let Some(actor) = actor {
            config.actor = actor.to_string();
        }
        Ledger::with_config(root, config)
    }

    pub fn with_config(root: &Path, config: EngineConfig) -> Result<Ledger> {
        config.validate()?;
        let fixed_now = config
            .now
            .as_deref()
            .map(|now| {
                DateTime::parse_from_rfc3339(now)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("parse now '{now}'"))
            })
            .transpose()?;
        let clock = HlcClock::open(root, &config.actor, fixed_now)?;
        let mut journal = FsJournal::new(root, &config.actor, clock)?;
        if config.journal.commit {
            journal = journal.with_git_commits()?;
        }
        debug!(root = %root.display(), actor = %config.actor, "ledger opened");
        Ok(Ledger {
            root: root.to_path_buf(),
            config,
            journal,
        })
    }

    /// Wall clock, or the configured fixed "now".
    pub fn now(&self) -> DateTime<Utc> {
        self.journal.clock().now()
    }
}
