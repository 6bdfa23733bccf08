//! Git adapter.
//!
//! A small, explicit async wrapper around `git` subprocess calls. Every failing
//! command surfaces as a [`GitError`] carrying the command line, exit code, and
//! stderr.

use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("spawn git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} failed (exit {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (`refs/heads/` stripped); `None` when detached.
    pub branch: Option<String>,
    pub bare: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the checked-out branch, or `None` on detached HEAD.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let name = out.trim();
        Ok((name != "HEAD" && !name.is_empty()).then(|| name.to_string()))
    }

    /// True when `workdir` is a usable checkout (HEAD resolves).
    pub async fn head_resolves(&self) -> bool {
        matches!(self.run(&["rev-parse", "HEAD"]).await, Ok(out) if out.status.success())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub async fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self
            .run_capture(&["status", "--porcelain=v1", "-uall"])
            .await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Human-readable short status.
    pub async fn status_short(&self) -> Result<String, GitError> {
        self.run_capture(&["status", "--short"]).await
    }

    pub async fn local_branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let out = self.run_capture(&["branch", "--list", branch]).await?;
        Ok(!out.trim().is_empty())
    }

    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let out = self
            .run_capture(&["ls-remote", "--heads", "origin", branch])
            .await?;
        Ok(!out.trim().is_empty())
    }

    /// True if `refs/...` resolves.
    pub async fn ref_exists(&self, full_ref: &str) -> bool {
        matches!(
            self.run(&["show-ref", "--verify", "--quiet", full_ref]).await,
            Ok(out) if out.status.success()
        )
    }

    #[instrument(skip_all, fields(branch))]
    pub async fn fetch(&self, branch: &str) -> Result<(), GitError> {
        debug!(branch, "fetching");
        self.run_checked(&["fetch", "origin", branch]).await?;
        Ok(())
    }

    pub async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    /// `checkout -B <branch> <start>`: create or reset a local branch and check it out.
    pub async fn checkout_reset(&self, branch: &str, start: &str) -> Result<(), GitError> {
        self.run_checked(&["checkout", "-B", branch, start]).await?;
        Ok(())
    }

    /// `merge --ff-only <rev>`: advance the current branch, never rewrite it.
    pub async fn merge_ff_only(&self, rev: &str) -> Result<(), GitError> {
        self.run_checked(&["merge", "--ff-only", rev]).await?;
        Ok(())
    }

    pub async fn rev_list_count(&self, range: &str) -> Result<u64> {
        let out = self.run_capture(&["rev-list", "--count", range]).await?;
        out.trim()
            .parse()
            .map_err(|_| anyhow!("unexpected rev-list output: '{}'", out.trim()))
    }

    /// Subjects of commits in `range`, newest first.
    pub async fn log_subjects(&self, range: &str) -> Result<Vec<String>, GitError> {
        let out = self
            .run_capture(&["log", "--format=%s", range])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip_all, fields(branch))]
    pub async fn push_upstream(&self, branch: &str) -> Result<(), GitError> {
        debug!(branch, "pushing");
        self.run_checked(&["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    pub async fn symbolic_ref(&self, name: &str) -> Result<Option<String>, GitError> {
        let out = self.run(&["symbolic-ref", name]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    pub async fn worktree_prune(&self) -> Result<(), GitError> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }

    /// `worktree add [-b <new_branch>] <path> <start>`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn worktree_add(
        &self,
        path: &Path,
        new_branch: Option<&str>,
        start: &str,
    ) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "add"];
        if let Some(branch) = new_branch {
            args.extend(["-b", branch]);
        }
        args.extend([&*path, start]);
        self.run_checked(&args).await?;
        Ok(())
    }

    pub async fn worktree_remove_force(&self, path: &Path) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &*path])
            .await?;
        Ok(())
    }

    pub async fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self
            .run_capture(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&out))
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, GitError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitError::Failed {
                command: args.join(" "),
                code: output.status.code(),
                stderr,
            });
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        trace!(args = %args.join(" "), workdir = %self.workdir.display(), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                command: args.join(" "),
                source,
            })
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse `git worktree list --porcelain` (blank-line separated records).
pub fn parse_worktree_list(raw: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in raw.lines() {
        if line.trim().is_empty() {
            entries.extend(current.take());
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
        } else if line == "bare" {
            entry.bare = true;
        }
    }
    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_worktree_porcelain() {
        let raw = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /wt/warden-issue-1\nHEAD def\nbranch refs/heads/warden/issue-1\n\nworktree /wt/detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_list(raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].path, PathBuf::from("/wt/warden-issue-1"));
        assert_eq!(entries[1].branch.as_deref(), Some("warden/issue-1"));
        assert_eq!(entries[2].branch, None);
        assert_eq!(entries[2].head.as_deref(), Some("123"));
    }

    #[test]
    fn git_error_names_command_and_stderr() {
        let err = GitError::Failed {
            command: "push -u origin x".to_string(),
            code: Some(128),
            stderr: "denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "git push -u origin x failed (exit Some(128)): denied"
        );
    }

    #[tokio::test]
    async fn failing_command_returns_git_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        let err = git.status_short().await.unwrap_err();
        assert!(matches!(err, GitError::Failed { .. }));
        assert!(!git.head_resolves().await);
    }
}
