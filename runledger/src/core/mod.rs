//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod event;
pub mod event_path;
pub mod expr;
pub mod hlc;
pub mod plan;
pub mod reward;
pub mod state;
pub mod template;
