//! Per-actor hybrid logical clock persisted under `.runledger/state/hlc/`.
//!
//! The persisted stamp is the only state that survives between invocations;
//! it keeps an actor's stamps monotonic across restarts even when the wall
//! clock steps backwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;
use ulid::Ulid;

use crate::core::hlc::Hlc;
use crate::io::config::{LEDGER_DIR, write_atomic};

/// Length of entity event nonces.
const NONCE_LEN: usize = 8;

#[derive(Debug)]
pub struct HlcClock {
    path: PathBuf,
    last: Option<Hlc>,
    fixed_now: Option<DateTime<Utc>>,
}

impl HlcClock {
    /// Open the clock for `actor`, loading its last persisted stamp.
    pub fn open(root: &Path, actor: &str, fixed_now: Option<DateTime<Utc>>) -> Result<HlcClock> {
        let path = root
            .join(LEDGER_DIR)
            .join("state")
            .join("hlc")
            .join(format!("{actor}.json"));
        let last = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read hlc state {}", path.display()))?;
            let stamp: Hlc = serde_json::from_str(&contents)
                .with_context(|| format!("parse hlc state {}", path.display()))?;
            Some(stamp)
        } else {
            None
        };
        debug!(path = %path.display(), last = ?last, "hlc opened");
        Ok(HlcClock {
            path,
            last,
            fixed_now,
        })
    }

    /// Wall clock, or the injected "now".
    pub fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    pub fn last(&self) -> Option<Hlc> {
        self.last
    }

    /// Stamp a local event and persist it.
    pub fn tick(&mut self) -> Result<Hlc> {
        let stamp = Hlc::tick(self.last, self.now().timestamp_millis());
        self.persist(stamp)?;
        Ok(stamp)
    }

    /// Fold a stamp written by another actor into this clock.
    pub fn observe(&mut self, remote: Hlc) -> Result<Hlc> {
        let stamp = Hlc::observe(self.last, remote, self.now().timestamp_millis());
        self.persist(stamp)?;
        Ok(stamp)
    }

    /// New ULID whose time component follows this clock.
    pub fn new_id(&self) -> String {
        Ulid::from_datetime(SystemTime::from(self.now())).to_string()
    }

    fn persist(&mut self, stamp: Hlc) -> Result<()> {
        let mut buf = serde_json::to_vec(&stamp).context("serialize hlc state")?;
        buf.push(b'\n');
        write_atomic(&self.path, &buf)?;
        self.last = Some(stamp);
        Ok(())
    }
}

/// Random nonce for entity event file names: lowercase alphanumerics.
pub fn new_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
