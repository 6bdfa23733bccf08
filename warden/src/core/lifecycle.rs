//! Naming and post-agent classification for issue workflows.

/// Branch prefix for issue implementations.
pub const ISSUE_BRANCH_PREFIX: &str = "warden/issue-";

pub fn issue_branch(number: u64) -> String {
    format!("{ISSUE_BRANCH_PREFIX}{number}")
}

/// Directory name of the isolation for `branch` (slashes flattened).
pub fn isolation_dir_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// What the isolation looks like after the agent finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSet {
    /// New commits relative to the base branch: push and open a PR.
    Committed,
    /// Nothing committed and a clean tree: the agent decided no change was needed.
    NoChanges,
    /// Edits were made but never committed: keep the isolation for inspection.
    Uncommitted,
}

pub fn classify_change_set(commits_ahead: bool, dirty: bool) -> ChangeSet {
    match (commits_ahead, dirty) {
        (true, _) => ChangeSet::Committed,
        (false, false) => ChangeSet::NoChanges,
        (false, true) => ChangeSet::Uncommitted,
    }
}
