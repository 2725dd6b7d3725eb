//! Side-effecting adapters: filesystem journal, clocks, git, subprocess hooks.
//!
//! Everything that touches the disk, the wall clock or a child process lives
//! here so that `core` stays a set of pure functions.

pub mod clock;
pub mod config;
pub mod git;
pub mod hooks;
pub mod instructions;
pub mod journal;
pub mod process;
pub mod schema;
pub mod template_store;
