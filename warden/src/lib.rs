//! Daemon that turns labeled GitHub issues into pull requests and reviews
//! labeled pull requests, by running a coding agent inside git worktrees.
//!
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (record types, agent event
//!   decoding, dispatch planning, comment formatting). No I/O.
//! - **[`io`]**: Side-effecting adapters (state file, git, subprocesses,
//!   the GitHub API). Each sits behind a type tests can replace.
//!
//! Orchestration modules ([`coordinator`], [`workflow`], [`status`], [`clear`],
//! [`orphans`]) combine the two to implement CLI commands.

pub mod clear;
pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orphans;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
