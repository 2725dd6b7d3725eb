//! Hybrid logical clock stamps.
//!
//! A stamp pairs the physical wall clock (milliseconds since the Unix epoch)
//! with a logical counter. Stamps produced by one actor are strictly
//! increasing even when the wall clock stalls or steps backwards.

use std::cmp::Ordering;
use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Width of the zero-padded wall clock component of a token.
const WALL_WIDTH: usize = 13;
/// Width of the zero-padded logical component of a token.
const LOGICAL_WIDTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hlc {
    pub wall_ms: i64,
    pub logical: u32,
}

impl Hlc {
    pub fn new(wall_ms: i64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    /// Next stamp for a local event.
    pub fn tick(last: Option<Hlc>, now_ms: i64) -> Hlc {
        match last {
            Some(last) if last.wall_ms >= now_ms => Hlc::new(last.wall_ms, last.logical + 1),
            _ => Hlc::new(now_ms, 0),
        }
    }

    /// Merge a stamp observed from another actor into the local clock.
    pub fn observe(local: Option<Hlc>, remote: Hlc, now_ms: i64) -> Hlc {
        let local = local.unwrap_or(Hlc::new(i64::MIN, 0));
        let wall = now_ms.max(local.wall_ms).max(remote.wall_ms);
        let logical = if wall == local.wall_ms && wall == remote.wall_ms {
            local.logical.max(remote.logical) + 1
        } else if wall == local.wall_ms {
            local.logical + 1
        } else if wall == remote.wall_ms {
            remote.logical + 1
        } else {
            0
        };
        Hlc::new(wall, logical)
    }

    /// Lexicographically sortable token, e.g. `1700000000000.000002`.
    pub fn token(&self) -> String {
        format!(
            "{:0wall$}.{:0logical$}",
            self.wall_ms,
            self.logical,
            wall = WALL_WIDTH,
            logical = LOGICAL_WIDTH
        )
    }

    pub fn parse_token(token: &str) -> Result<Hlc> {
        let (wall, logical) = token
            .split_once('.')
            .ok_or_else(|| anyhow!("invalid hlc token '{token}'"))?;
        let wall_ms = wall
            .parse::<i64>()
            .map_err(|_| anyhow!("invalid hlc wall clock in '{token}'"))?;
        let logical = logical
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid hlc counter in '{token}'"))?;
        Ok(Hlc::new(wall_ms, logical))
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.wall_ms).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// RFC3339 rendering of the physical component (millisecond precision).
    pub fn rfc3339(&self) -> String {
        self.datetime().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.logical.cmp(&other.logical))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_uses_wall_clock_when_it_advances() {
        let stamp = Hlc::tick(Some(Hlc::new(100, 7)), 200);
        assert_eq!(stamp, Hlc::new(200, 0));
    }

    #[test]
    fn tick_bumps_logical_when_clock_stalls_or_regresses() {
        let first = Hlc::tick(None, 500);
        let second = Hlc::tick(Some(first), 500);
        let third = Hlc::tick(Some(second), 400);
        assert!(first < second);
        assert!(second < third);
        assert_eq!(third, Hlc::new(500, 2));
    }

    #[test]
    fn observe_moves_past_remote_stamp() {
        let merged = Hlc::observe(Some(Hlc::new(100, 1)), Hlc::new(300, 4), 200);
        assert_eq!(merged, Hlc::new(300, 5));

        let merged = Hlc::observe(Some(Hlc::new(300, 9)), Hlc::new(300, 4), 200);
        assert_eq!(merged, Hlc::new(300, 10));

        let merged = Hlc::observe(None, Hlc::new(100, 4), 900);
        assert_eq!(merged, Hlc::new(900, 0));
    }

    #[test]
    fn tokens_sort_like_stamps() {
        let a = Hlc::new(99, 12);
        let b = Hlc::new(100, 0);
        assert!(a.token() < b.token());
        assert_eq!(Hlc::parse_token(&b.token()).expect("parse"), b);
        assert_eq!(b.token(), "0000000000100.000000");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Hlc::parse_token("nope").is_err());
        assert!(Hlc::parse_token("12.x").is_err());
    }
}
