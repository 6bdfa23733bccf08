//! One git worktree per work item.
//!
//! Operations that touch shared git metadata (worktree registration, prune,
//! switching the primary checkout) run under one async lock per repository.
//! Read-only queries inside an isolation do not take the lock.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::isolation_dir_name;
use crate::io::git::Git;

/// A working copy bound to one branch, owned by one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolation {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug)]
pub struct IsolationManager {
    repo: Git,
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl IsolationManager {
    pub fn new(repo_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo: Git::new(repo_path),
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        self.repo.workdir()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path the isolation for `branch` lives at.
    pub fn path_for(&self, branch: &str) -> PathBuf {
        self.base_dir.join(isolation_dir_name(branch))
    }

    /// Create (or reuse) the isolation for `branch`.
    ///
    /// With `checkout_existing` the branch must already exist locally or on the
    /// remote; otherwise a new branch is started from `origin/<base>`.
    #[instrument(skip_all, fields(branch, base = base_branch, checkout_existing))]
    pub async fn create(
        &self,
        branch: &str,
        base_branch: &str,
        checkout_existing: bool,
    ) -> Result<Isolation> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(branch);

        self.repo.worktree_prune().await?;

        if path.exists() {
            if Git::new(&path).head_resolves().await {
                info!(path = %path.display(), "reusing existing isolation");
                if checkout_existing {
                    self.refresh_reused(&path, branch).await;
                }
                return Ok(Isolation {
                    path,
                    branch: branch.to_string(),
                });
            }
            warn!(path = %path.display(), "isolation is corrupted, recreating");
            remove_dir(&path).await?;
            self.repo.worktree_prune().await?;
        }

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("create directory {}", self.base_dir.display()))?;

        if let Err(err) = self.repo.fetch(base_branch).await {
            warn!(err = %err, "fetch of base branch failed, continuing with local refs");
        }

        // A branch can only be checked out in one worktree at a time.
        if self.repo.current_branch().await?.as_deref() == Some(branch) {
            debug!("primary checkout holds the branch, switching it to base");
            self.repo.checkout(base_branch).await?;
        }

        if checkout_existing {
            self.add_existing(&path, branch).await?;
        } else {
            let start = self.base_ref(base_branch).await;
            self.repo.worktree_add(&path, Some(branch), &start).await?;
        }

        info!(path = %path.display(), "isolation created");
        Ok(Isolation {
            path,
            branch: branch.to_string(),
        })
    }

    async fn add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        if let Err(err) = self.repo.fetch(branch).await {
            debug!(err = %err, "fetch of branch failed");
        }
        if self.repo.remote_branch_exists(branch).await? {
            let remote = format!("origin/{branch}");
            self.repo.worktree_add(path, None, &remote).await?;
            // The worktree starts detached at the remote ref; give it a local tracking branch.
            Git::new(path).checkout_reset(branch, &remote).await?;
        } else {
            self.repo.worktree_add(path, None, branch).await?;
        }
        Ok(())
    }

    /// Bring a reused isolation up to the branch's remote head. Only a clean
    /// tree is touched and only by fast-forward, so local commits survive.
    async fn refresh_reused(&self, path: &Path, branch: &str) {
        if let Err(err) = self.repo.fetch(branch).await {
            debug!(err = %err, "fetch of branch failed, keeping isolation as is");
            return;
        }
        let remote = format!("origin/{branch}");
        if !self.repo.ref_exists(&format!("refs/remotes/{remote}")).await {
            return;
        }
        let git = Git::new(path);
        match git.status_porcelain().await {
            Ok(entries) if entries.is_empty() => {}
            Ok(_) => {
                debug!("isolation has uncommitted changes, not refreshing");
                return;
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not read isolation status");
                return;
            }
        }
        match git.merge_ff_only(&remote).await {
            Ok(()) => debug!(remote = %remote, "isolation refreshed"),
            Err(err) => warn!(err = %err, "isolation diverged from remote, keeping local state"),
        }
    }

    /// `origin/<base>` when it exists, else the local branch.
    async fn base_ref(&self, base_branch: &str) -> String {
        let remote = format!("origin/{base_branch}");
        if self
            .repo
            .ref_exists(&format!("refs/remotes/{remote}"))
            .await
        {
            remote
        } else {
            base_branch.to_string()
        }
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        if self.repo.local_branch_exists(branch).await? {
            return Ok(true);
        }
        Ok(self.repo.remote_branch_exists(branch).await?)
    }

    pub async fn has_commits_ahead(&self, isolation: &Isolation, base_branch: &str) -> Result<bool> {
        let git = Git::new(&isolation.path);
        let base = self.base_ref(base_branch).await;
        let count = git.rev_list_count(&format!("{base}..HEAD")).await?;
        debug!(count, base = %base, "commits ahead of base");
        Ok(count > 0)
    }

    pub async fn has_uncommitted_changes(&self, isolation: &Isolation) -> Result<bool> {
        let entries = Git::new(&isolation.path).status_porcelain().await?;
        Ok(!entries.is_empty())
    }

    pub async fn get_uncommitted_status(&self, isolation: &Isolation) -> Result<String> {
        Ok(Git::new(&isolation.path).status_short().await?)
    }

    /// Subjects of commits the isolation has on top of the base branch.
    pub async fn commit_subjects(&self, isolation: &Isolation, base_branch: &str) -> Result<Vec<String>> {
        let base = self.base_ref(base_branch).await;
        Ok(Git::new(&isolation.path)
            .log_subjects(&format!("{base}..HEAD"))
            .await?)
    }

    pub async fn push_branch(&self, isolation: &Isolation, branch: &str) -> Result<()> {
        Git::new(&isolation.path).push_upstream(branch).await?;
        Ok(())
    }

    pub async fn cleanup(&self, isolation: &Isolation) -> Result<()> {
        self.cleanup_path(&isolation.path).await
    }

    /// Remove the worktree at `path`. A missing path is a no-op.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn cleanup_path(&self, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !path.exists() {
            debug!("isolation already gone");
            return Ok(());
        }
        if let Err(err) = self.repo.worktree_remove_force(path).await {
            warn!(err = %err, "worktree remove failed, deleting directory");
        }
        if path.exists() {
            remove_dir(path).await?;
        }
        self.repo.worktree_prune().await?;
        info!("isolation removed");
        Ok(())
    }

    /// Default branch of `origin`: `origin/HEAD`, then `main`, then `master`.
    pub async fn get_default_branch(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        if let Some(full) = self.repo.symbolic_ref("refs/remotes/origin/HEAD").await?
            && let Some(name) = full.strip_prefix("refs/remotes/origin/")
        {
            return Ok(name.to_string());
        }
        for candidate in ["main", "master"] {
            if self
                .repo
                .ref_exists(&format!("refs/remotes/origin/{candidate}"))
                .await
            {
                return Ok(candidate.to_string());
            }
        }
        Ok("main".to_string())
    }

    /// Every isolation registered with the repository, excluding the primary checkout.
    pub async fn list_all(&self) -> Result<Vec<Isolation>> {
        let entries = self.repo.worktree_list().await?;
        let primary = canonical(self.repo.workdir());
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.bare && canonical(&entry.path) != primary)
            .map(|entry| Isolation {
                branch: entry.branch.unwrap_or_default(),
                path: entry.path,
            })
            .collect())
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn remove_dir(path: &Path) -> Result<()> {
    tokio::fs::remove_dir_all(path)
        .await
        .with_context(|| format!("remove {}", path.display()))
}
