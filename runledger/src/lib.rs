//! Run orchestration over an event-sourced, file-backed journal.
//!
//! Every run is a directory of immutable event records under
//! `.runledger/runs/<run_id>/`. State is never stored; it is derived by
//! folding the journal, and the next transition is planned from that state.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (clock, event grammar, templates,
//!   guard expressions, reward scoring, state derivation, planning).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (journal files, config, schemas,
//!   git, hook processes). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`dispatch`], [`reconcile`], [`hook_exec`], [`tick`],
//! [`sweep`], [`resume`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod hook_exec;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod reconcile;
pub mod resume;
pub mod sweep;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tick;
