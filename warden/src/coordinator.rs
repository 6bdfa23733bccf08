//! Poll loop: discover labeled work, dedup against the store and live tasks,
//! and launch workflows up to the concurrency ceiling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::activity::ActivityBoard;
use crate::core::dispatch::{ReviewPolicy, available_slots, select_candidates};
use crate::core::text::one_line;
use crate::core::types::ItemKey;
use crate::io::agent::AgentInvoker;
use crate::io::config::WardenConfig;
use crate::io::isolation::IsolationManager;
use crate::io::progress::{PROGRESS_CAPACITY, ProgressSink};
use crate::io::repo_host::{Issue, PullRequest, RepoHost};
use crate::io::store::WorkItemStore;
use crate::workflow::issue::run_issue_workflow;
use crate::workflow::review::run_review_workflow;
use crate::workflow::{WorkflowContext, WorkflowEnd, WorkflowSettings};

/// Finished agents stay on the board this long before being pruned.
const FINISHED_GRACE_MINUTES: i64 = 5;
const ACTIVITY_LINE_CHARS: usize = 120;

/// Stops a running [`Coordinator`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Coordinator {
    ctx: Arc<WorkflowContext>,
    max_concurrent: usize,
    poll_interval: Duration,
    stale_after_hours: Option<u64>,
    policy: ReviewPolicy,
    tasks: HashMap<ItemKey, JoinHandle<WorkflowEnd>>,
    shutdown: CancellationToken,
    board: Arc<Mutex<ActivityBoard>>,
    progress_task: JoinHandle<()>,
}

impl Coordinator {
    /// Open the store, recover interrupted items, resolve the base branch, and
    /// start the progress consumer.
    #[instrument(skip_all, fields(repo = %cfg.github.repo))]
    pub async fn bootstrap(
        cfg: &WardenConfig,
        host: Arc<dyn RepoHost>,
        agent: Arc<dyn AgentInvoker>,
    ) -> Result<Self> {
        let store = WorkItemStore::open(cfg.state_file_path());
        let reset = store
            .reset_in_progress_items()
            .context("reset interrupted work items")?;
        if reset > 0 {
            info!(count = reset, "reset interrupted work items");
        }

        let isolation = IsolationManager::new(&cfg.repo_path, cfg.worktree_base_path());
        let base_branch = match &cfg.base_branch {
            Some(branch) => branch.clone(),
            None => isolation
                .get_default_branch()
                .await
                .context("resolve default branch")?,
        };
        info!(base = %base_branch, worktrees = %isolation.base_dir().display(), "coordinator ready");

        let board = Arc::new(Mutex::new(ActivityBoard::new()));
        let (sink, mut rx) = ProgressSink::channel(PROGRESS_CAPACITY);
        let consumer_board = Arc::clone(&board);
        let progress_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(mut board) = consumer_board.lock() {
                    board.apply(event, Utc::now());
                }
            }
        });

        let ctx = WorkflowContext {
            store,
            isolation,
            host,
            agent,
            settings: WorkflowSettings::from_config(cfg, base_branch),
            progress: Some(sink),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            max_concurrent: cfg.max_concurrent,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            stale_after_hours: cfg.stale_after_hours,
            policy: ReviewPolicy {
                trigger_label: cfg.labels.trigger.clone(),
                review_authors: cfg.github.review_authors.clone(),
            },
            tasks: HashMap::new(),
            shutdown: CancellationToken::new(),
            board,
            progress_task,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn context(&self) -> &Arc<WorkflowContext> {
        &self.ctx
    }

    pub fn activity(&self) -> Arc<Mutex<ActivityBoard>> {
        Arc::clone(&self.board)
    }

    /// Keys of workflows currently running.
    pub fn live_keys(&self) -> Vec<ItemKey> {
        let mut keys: Vec<ItemKey> = self.tasks.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Run poll cycles until stopped, then abort live workflows and close the host.
    pub async fn start(mut self) -> Result<()> {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            "polling started"
        );
        while !self.shutdown.is_cancelled() {
            if let Err(err) = self.poll_cycle().await {
                error!(err = %format!("{err:#}"), "poll cycle failed");
            }
            self.log_activity();
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(live = self.tasks.len(), "shutting down");
        self.teardown(true).await;
        Ok(())
    }

    /// One poll cycle, then wait for every launched workflow to finish.
    pub async fn run_once(mut self) -> Result<Vec<(ItemKey, WorkflowEnd)>> {
        self.poll_cycle().await?;
        let finished = self.drain().await;
        self.teardown(false).await;
        Ok(finished)
    }

    /// Dispatch new workflows. Returns the keys launched this cycle.
    #[instrument(skip_all)]
    pub async fn poll_cycle(&mut self) -> Result<Vec<ItemKey>> {
        self.reap().await;

        if let Some(hours) = self.stale_after_hours {
            let live: HashSet<ItemKey> = self.tasks.keys().copied().collect();
            match self.ctx.store.cleanup_stale_items(hours, &live) {
                Ok(0) => {}
                Ok(count) => info!(count, hours, "reset stale work items"),
                Err(err) => warn!(err = %format!("{err:#}"), "stale item cleanup failed"),
            }
        }

        let mut busy: HashSet<ItemKey> = self
            .ctx
            .store
            .in_progress_keys()
            .context("read in-progress items")?
            .into_iter()
            .collect();
        busy.extend(self.tasks.keys().copied());

        let mut slots = available_slots(self.max_concurrent, busy.len());
        if slots == 0 {
            info!(busy = busy.len(), max = self.max_concurrent, "at capacity, skipping poll");
            return Ok(Vec::new());
        }

        let mut launched = Vec::new();

        let issues = match self
            .ctx
            .host
            .list_labeled_issues(&self.ctx.settings.labels.trigger)
            .await
        {
            Ok(issues) => issues,
            Err(err) => {
                warn!(err = %err, "failed to list issues");
                Vec::new()
            }
        };
        debug!(count = issues.len(), "labeled issues");
        let picked = select_candidates(
            issues,
            |issue| ItemKey::issue(issue.number),
            |key| self.is_busy(&busy, key),
            slots,
        );
        slots -= picked.len();
        for issue in picked {
            let key = ItemKey::issue(issue.number);
            busy.insert(key);
            self.spawn_issue(issue);
            launched.push(key);
        }

        if slots > 0 {
            let prs = match self.ctx.host.list_open_prs().await {
                Ok(prs) => prs,
                Err(err) => {
                    warn!(err = %err, "failed to list pull requests");
                    Vec::new()
                }
            };
            let eligible: Vec<PullRequest> = prs
                .into_iter()
                .filter(|pr| self.policy.is_eligible(&pr.labels, &pr.author, pr.draft))
                .collect();
            debug!(count = eligible.len(), "reviewable pull requests");
            let picked = select_candidates(
                eligible,
                |pr| ItemKey::review(pr.number),
                |key| self.is_busy(&busy, key),
                slots,
            );
            for pr in picked {
                let key = ItemKey::review(pr.number);
                busy.insert(key);
                self.spawn_review(pr);
                launched.push(key);
            }
        }

        if !launched.is_empty() {
            info!(count = launched.len(), live = self.tasks.len(), "dispatched work items");
        }
        Ok(launched)
    }

    fn is_busy(&self, busy: &HashSet<ItemKey>, key: ItemKey) -> bool {
        if busy.contains(&key) || self.tasks.contains_key(&key) {
            return true;
        }
        match self.ctx.store.is_processing(key.kind, key.number) {
            Ok(processing) => processing,
            Err(err) => {
                warn!(key = %key, err = %format!("{err:#}"), "store lookup failed, skipping");
                true
            }
        }
    }

    fn spawn_issue(&mut self, issue: Issue) {
        let key = ItemKey::issue(issue.number);
        let ctx = Arc::clone(&self.ctx);
        info!(key = %key, title = %issue.title, "starting issue workflow");
        let handle = tokio::spawn(async move { run_issue_workflow(&ctx, &issue).await });
        self.tasks.insert(key, handle);
    }

    fn spawn_review(&mut self, pr: PullRequest) {
        let key = ItemKey::review(pr.number);
        let ctx = Arc::clone(&self.ctx);
        info!(key = %key, title = %pr.title, "starting review workflow");
        let handle = tokio::spawn(async move { run_review_workflow(&ctx, &pr).await });
        self.tasks.insert(key, handle);
    }

    /// Remove finished tasks from the live set.
    async fn reap(&mut self) {
        let finished: Vec<ItemKey> = self
            .tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(key, _)| *key)
            .collect();
        for key in finished {
            if let Some(handle) = self.tasks.remove(&key) {
                self.settle(key, handle).await;
            }
        }
    }

    /// Wait for every live workflow to finish.
    pub async fn drain(&mut self) -> Vec<(ItemKey, WorkflowEnd)> {
        let mut finished = Vec::new();
        let mut keys: Vec<ItemKey> = self.tasks.keys().copied().collect();
        keys.sort();
        for key in keys {
            if let Some(handle) = self.tasks.remove(&key)
                && let Some(end) = self.settle(key, handle).await
            {
                finished.push((key, end));
            }
        }
        finished
    }

    /// Join one task. A panicked workflow is recorded as failed so it is not
    /// stuck `in_progress` until the next restart.
    async fn settle(&self, key: ItemKey, handle: JoinHandle<WorkflowEnd>) -> Option<WorkflowEnd> {
        match handle.await {
            Ok(end) => {
                debug!(key = %key, completed = end.is_completed(), "workflow finished");
                Some(end)
            }
            Err(err) if err.is_cancelled() => None,
            Err(err) => {
                error!(key = %key, err = %err, "workflow task panicked");
                let message = format!("workflow task panicked: {err}");
                if let Err(err) = self.ctx.store.mark_failed(key.kind, key.number, &message) {
                    error!(key = %key, err = %format!("{err:#}"), "failed to record panic");
                }
                Some(WorkflowEnd::Failed {
                    message,
                    preserved: None,
                })
            }
        }
    }

    fn log_activity(&self) {
        let Ok(mut board) = self.board.lock() else {
            return;
        };
        board.prune_finished(Utc::now(), chrono::Duration::minutes(FINISHED_GRACE_MINUTES));
        for agent in board.running() {
            info!(
                key = %agent.key,
                tool = agent.current_tool.as_deref().unwrap_or("-"),
                last = %agent.last_line().map(|l| one_line(l, ACTIVITY_LINE_CHARS)).unwrap_or_default(),
                "agent running"
            );
        }
    }

    async fn teardown(&mut self, abort: bool) {
        if abort {
            for handle in self.tasks.values() {
                handle.abort();
            }
        }
        let keys: Vec<ItemKey> = self.tasks.keys().copied().collect();
        for key in keys {
            if let Some(handle) = self.tasks.remove(&key) {
                self.settle(key, handle).await;
            }
        }
        self.ctx.host.close().await;
        self.progress_task.abort();
    }
}

