//! Side-effecting adapters: filesystem state, git, subprocesses, the remote host.

pub mod agent;
pub mod checks;
pub mod config;
pub mod git;
pub mod github;
pub mod isolation;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod repo_host;
pub mod setup_hook;
pub mod store;
