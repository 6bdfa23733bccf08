//! Test helpers: a real git repository with a bare `origin`, an in-memory
//! repository host, and a scripted agent.
//!
//! Compiled for unit tests and for integration tests through the
//! `test-support` feature.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::core::outcome::Outcome;
use crate::io::agent::{AgentInvoker, AgentRequest};
use crate::io::config::{GithubConfig, WardenConfig};
use crate::io::repo_host::{
    CheckStatus, Comment, CreatePullRequest, HostResult, Issue, PullRequest, RepoHost,
    RepoHostError,
};

/// Temporary git repository on `main` with one commit, pushed to a bare
/// `origin` whose `HEAD` points at `main`.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
    origin: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir_all(&root).context("create repo dir")?;

        run_git(temp.path(), &["init", "--bare", "-b", "main", &path_str(&origin)])?;
        run_git(&root, &["init", "-b", "main"])?;
        run_git(&root, &["config", "user.email", "warden@example.com"])?;
        run_git(&root, &["config", "user.name", "Warden Test"])?;
        run_git(&root, &["config", "commit.gpgsign", "false"])?;
        std::fs::write(root.join("README.md"), "# widgets\n").context("write README")?;
        run_git(&root, &["add", "README.md"])?;
        run_git(&root, &["commit", "-m", "initial commit"])?;
        run_git(&root, &["remote", "add", "origin", &path_str(&origin)])?;
        run_git(&root, &["push", "-u", "origin", "main"])?;
        run_git(&root, &["remote", "set-head", "origin", "main"])?;

        Ok(Self { temp, root, origin })
    }

    /// Primary checkout.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn worktree_base(&self) -> PathBuf {
        self.temp.path().join("worktrees")
    }

    pub fn state_file(&self) -> PathBuf {
        self.temp.path().join("state.json")
    }

    /// Valid config pointing at this repository.
    pub fn config(&self) -> WardenConfig {
        WardenConfig {
            repo_path: self.root.clone(),
            worktree_base: Some(self.worktree_base()),
            state_file: self.state_file(),
            poll_interval_secs: 1,
            github: GithubConfig {
                repo: "acme/widgets".to_string(),
                ..GithubConfig::default()
            },
            ..WardenConfig::default()
        }
    }

    /// Run git in the primary checkout and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        run_git(&self.root, args)
    }

    /// Create `branch` on `origin` with one extra commit, leaving no local branch.
    pub fn push_remote_branch(&self, branch: &str, file: &str, contents: &str) -> Result<()> {
        self.git(&["checkout", "-b", branch, "main"])?;
        std::fs::write(self.root.join(file), contents).with_context(|| format!("write {file}"))?;
        self.git(&["add", file])?;
        self.git(&["commit", "-m", &format!("work in progress on {branch}")])?;
        self.git(&["push", "origin", branch])?;
        self.git(&["checkout", "main"])?;
        self.git(&["branch", "-D", branch])?;
        Ok(())
    }

    /// True when `origin` has `branch`.
    pub fn origin_has_branch(&self, branch: &str) -> Result<bool> {
        let out = run_git(&self.origin, &["branch", "--list", branch])?;
        Ok(!out.is_empty())
    }

    /// Commit subjects on `origin/<branch>` not on `main`, newest first.
    pub fn origin_subjects(&self, branch: &str) -> Result<Vec<String>> {
        let out = run_git(&self.origin, &["log", "--format=%s", &format!("main..{branch}")])?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Everything the fake host has seen or holds.
#[derive(Debug, Clone, Default)]
pub struct FakeHostState {
    pub issues: BTreeMap<u64, Issue>,
    pub prs: BTreeMap<u64, PullRequest>,
    pub comments: BTreeMap<u64, Vec<Comment>>,
    pub created_prs: Vec<CreatePullRequest>,
    pub check_status: Option<CheckStatus>,
    pub fail_listing: bool,
    pub fail_create_pr: bool,
    pub closed: bool,
    next_pr_number: u64,
    next_comment_id: u64,
}

/// In-memory [`RepoHost`]. Issues and PRs share one number space.
#[derive(Debug, Default)]
pub struct FakeRepoHost {
    state: Mutex<FakeHostState>,
}

impl FakeRepoHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeHostState> {
        self.state.lock().expect("fake host lock poisoned")
    }

    pub fn add_issue(&self, number: u64, title: &str, body: &str, labels: &[&str]) {
        self.lock().issues.insert(
            number,
            Issue {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.iter().map(|l| (*l).to_string()).collect(),
                author: "alice".to_string(),
            },
        );
    }

    pub fn add_pr(&self, pr: PullRequest) {
        self.lock().prs.insert(pr.number, pr);
    }

    pub fn add_comment(&self, number: u64, body: &str) {
        let mut state = self.lock();
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.comments.entry(number).or_default().push(Comment {
            id,
            author: "someone".to_string(),
            body: body.to_string(),
            created_at: Some(Utc::now()),
        });
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    pub fn set_fail_create_pr(&self, fail: bool) {
        self.lock().fail_create_pr = fail;
    }

    pub fn set_check_status(&self, status: CheckStatus) {
        self.lock().check_status = Some(status);
    }

    pub fn snapshot(&self) -> FakeHostState {
        self.lock().clone()
    }

    /// Comment bodies on issue or PR `number`, oldest first.
    pub fn comments_on(&self, number: u64) -> Vec<String> {
        self.lock()
            .comments
            .get(&number)
            .map(|c| c.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn labels_of(&self, number: u64) -> Vec<String> {
        let state = self.lock();
        if let Some(issue) = state.issues.get(&number) {
            return issue.labels.clone();
        }
        state
            .prs
            .get(&number)
            .map(|pr| pr.labels.clone())
            .unwrap_or_default()
    }

    fn labels_mut(state: &mut FakeHostState, number: u64) -> HostResult<&mut Vec<String>> {
        if let Some(issue) = state.issues.get_mut(&number) {
            return Ok(&mut issue.labels);
        }
        if let Some(pr) = state.prs.get_mut(&number) {
            return Ok(&mut pr.labels);
        }
        Err(not_found(number))
    }
}

fn not_found(number: u64) -> RepoHostError {
    RepoHostError::Api {
        status: 404,
        message: format!("#{number} not found"),
    }
}

/// Open, non-draft PR fixture.
pub fn pull_request(number: u64, branch: &str, labels: &[&str]) -> PullRequest {
    PullRequest {
        number,
        title: format!("PR {number}"),
        body: String::new(),
        labels: labels.iter().map(|l| (*l).to_string()).collect(),
        author: "bob".to_string(),
        branch: branch.to_string(),
        base_branch: "main".to_string(),
        head_sha: format!("sha{number}"),
        draft: false,
        url: format!("https://github.com/acme/widgets/pull/{number}"),
    }
}

#[async_trait]
impl RepoHost for FakeRepoHost {
    async fn list_labeled_issues(&self, label: &str) -> HostResult<Vec<Issue>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(RepoHostError::Transport("listing disabled".to_string()));
        }
        Ok(state
            .issues
            .values()
            .filter(|issue| issue.labels.iter().any(|l| l == label))
            .cloned()
            .collect())
    }

    async fn list_open_prs(&self) -> HostResult<Vec<PullRequest>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(RepoHostError::Transport("listing disabled".to_string()));
        }
        Ok(state.prs.values().cloned().collect())
    }

    async fn get_issue(&self, number: u64) -> HostResult<Issue> {
        self.lock()
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| not_found(number))
    }

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest> {
        self.lock()
            .prs
            .get(&number)
            .cloned()
            .ok_or_else(|| not_found(number))
    }

    async fn get_pr_comments(&self, number: u64) -> HostResult<Vec<Comment>> {
        Ok(self.lock().comments.get(&number).cloned().unwrap_or_default())
    }

    async fn post_comment(&self, number: u64, body: &str) -> HostResult<()> {
        self.add_comment(number, body);
        Ok(())
    }

    async fn create_pr(&self, request: &CreatePullRequest) -> HostResult<PullRequest> {
        let mut state = self.lock();
        if state.fail_create_pr {
            return Err(RepoHostError::Api {
                status: 422,
                message: "Validation Failed".to_string(),
            });
        }
        state.next_pr_number += 1;
        let number = 1000 + state.next_pr_number;
        let pr = PullRequest {
            number,
            title: request.title.clone(),
            body: request.body.clone(),
            labels: Vec::new(),
            author: "warden".to_string(),
            branch: request.head.clone(),
            base_branch: request.base.clone(),
            head_sha: String::new(),
            draft: false,
            url: format!("https://github.com/acme/widgets/pull/{number}"),
        };
        state.created_prs.push(request.clone());
        state.prs.insert(number, pr.clone());
        Ok(pr)
    }

    async fn add_label(&self, number: u64, label: &str) -> HostResult<()> {
        let mut state = self.lock();
        let labels = Self::labels_mut(&mut state, number)?;
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> HostResult<()> {
        let mut state = self.lock();
        let labels = Self::labels_mut(&mut state, number)?;
        labels.retain(|l| l != label);
        Ok(())
    }

    async fn get_check_status(&self, pr: &PullRequest) -> HostResult<CheckStatus> {
        self.lock()
            .check_status
            .clone()
            .ok_or_else(|| not_found(pr.number))
    }

    fn pull_request_url(&self, number: u64) -> String {
        format!("https://github.com/acme/widgets/pull/{number}")
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

/// What a scripted run does to the isolation before returning its outcome.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    Nothing,
    Commit {
        file: String,
        contents: String,
        message: String,
    },
    WriteUncommitted {
        file: String,
        contents: String,
    },
}

#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub action: ScriptedAction,
    pub outcome: Outcome,
}

impl ScriptedRun {
    pub fn commit(file: &str, message: &str, summary: &str) -> Self {
        Self {
            action: ScriptedAction::Commit {
                file: file.to_string(),
                contents: format!("{message}\n"),
                message: message.to_string(),
            },
            outcome: Outcome::success(summary),
        }
    }

    pub fn no_changes(summary: &str) -> Self {
        Self {
            action: ScriptedAction::Nothing,
            outcome: Outcome::success(summary),
        }
    }

    pub fn uncommitted(file: &str) -> Self {
        Self {
            action: ScriptedAction::WriteUncommitted {
                file: file.to_string(),
                contents: "draft\n".to_string(),
            },
            outcome: Outcome::success("Edited files"),
        }
    }

    pub fn failure(summary: &str) -> Self {
        Self {
            action: ScriptedAction::Nothing,
            outcome: Outcome::failure(summary),
        }
    }
}

/// [`AgentInvoker`] that replays queued runs in order. When the queue is
/// empty it answers with a successful no-change run.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    runs: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<AgentRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            ..Self::default()
        }
    }

    /// Every invocation consumes one permit from `gate` before acting.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    fn next_run(&self) -> ScriptedRun {
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::no_changes("Nothing to change"))
    }
}

async fn git_in(dir: &Path, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .await
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        bail!("git {} failed in {}", args.join(" "), dir.display());
    }
    Ok(())
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<Outcome> {
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.context("gate closed")?.forget();
        }
        let run = self.next_run();
        let dir = &request.workdir;
        match &run.action {
            ScriptedAction::Nothing => {}
            ScriptedAction::Commit {
                file,
                contents,
                message,
            } => {
                tokio::fs::write(dir.join(file), contents)
                    .await
                    .with_context(|| format!("write {file}"))?;
                git_in(dir, &["add", file]).await?;
                git_in(dir, &["commit", "-m", message]).await?;
            }
            ScriptedAction::WriteUncommitted { file, contents } => {
                tokio::fs::write(dir.join(file), contents)
                    .await
                    .with_context(|| format!("write {file}"))?;
            }
        }
        Ok(run.outcome)
    }
}
