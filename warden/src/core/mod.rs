//! Deterministic, pure logic shared by the daemon.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod activity;
pub mod agent_event;
pub mod checks;
pub mod comments;
pub mod dispatch;
pub mod lifecycle;
pub mod outcome;
pub mod text;
pub mod types;
