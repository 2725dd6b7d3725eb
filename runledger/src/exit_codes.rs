//! Stable exit codes for runledger CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: bad input, unreadable journal, invalid template or config.
pub const INVALID: i32 = 1;
/// The run is waiting on a human or on dependent runs.
pub const BLOCKED: i32 = 30;
