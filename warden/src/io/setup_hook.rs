//! Optional per-isolation setup script (install deps, copy env files, ...).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{info, instrument};

use crate::core::text::truncate_chars;
use crate::core::types::{ItemKey, WorkItemKind};
use crate::io::process::run_command_with_timeout;

const SETUP_OUTPUT_LIMIT_BYTES: usize = 200_000;
const SETUP_ERROR_CHARS: usize = 2000;

/// Everything the script learns about the work it prepares for.
#[derive(Debug, Clone)]
pub struct SetupContext {
    pub script: PathBuf,
    pub parent_repo: PathBuf,
    pub worktree: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub key: ItemKey,
    pub timeout: Duration,
}

impl SetupContext {
    fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("WARDEN_PARENT_REPO", self.parent_repo.display().to_string()),
            ("WARDEN_WORKTREE", self.worktree.display().to_string()),
            ("WARDEN_BRANCH", self.branch.clone()),
            ("WARDEN_BASE_BRANCH", self.base_branch.clone()),
            ("WARDEN_WORK_TYPE", self.key.kind.as_str().to_string()),
        ];
        let number_var = match self.key.kind {
            WorkItemKind::Issue => "WARDEN_ISSUE_NUMBER",
            WorkItemKind::PrReview | WorkItemKind::PrMerge => "WARDEN_PR_NUMBER",
        };
        env.push((number_var, self.key.number.to_string()));
        env
    }
}

/// Run `sh <script>` inside the worktree. Non-zero exit or timeout is an error
/// carrying the combined output.
#[instrument(skip_all, fields(key = %ctx.key, script = %ctx.script.display()))]
pub async fn run_setup_script(ctx: &SetupContext) -> Result<()> {
    if !ctx.script.exists() {
        bail!("setup script not found: {}", ctx.script.display());
    }
    info!("running setup script");
    let mut cmd = Command::new("sh");
    cmd.arg(&ctx.script)
        .current_dir(&ctx.worktree)
        .envs(ctx.env());
    let out = run_command_with_timeout(cmd, None, ctx.timeout, SETUP_OUTPUT_LIMIT_BYTES)
        .await
        .context("run setup script")?;
    if out.timed_out {
        bail!(
            "setup script timed out after {}s: {}",
            ctx.timeout.as_secs(),
            truncate_chars(&out.combined(), SETUP_ERROR_CHARS)
        );
    }
    if !out.status.success() {
        bail!(
            "setup script failed (exit {}): {}",
            out.exit_code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
            truncate_chars(&out.combined(), SETUP_ERROR_CHARS)
        );
    }
    Ok(())
}
