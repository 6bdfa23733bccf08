//! Per-item workflows.
//!
//! Each workflow is an explicit state enum advanced by one transition function.
//! Any error inside a transition moves the workflow to its `Failed` state; the
//! terminal states are finalized here (store update, best-effort comment,
//! isolation cleanup) so failures never escape to the poll loop.

pub mod issue;
pub mod review;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::core::activity::ProgressEvent;
use crate::core::types::ItemKey;
use crate::io::agent::AgentInvoker;
use crate::io::config::{LabelConfig, WardenConfig};
use crate::io::isolation::{Isolation, IsolationManager};
use crate::io::progress::ProgressSink;
use crate::io::repo_host::RepoHost;
use crate::io::setup_hook::{SetupContext, run_setup_script};
use crate::io::store::WorkItemStore;

/// Knobs the workflows read; resolved once at bootstrap.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub base_branch: String,
    pub labels: LabelConfig,
    pub agent_timeout: Duration,
    pub implement_tools: Vec<String>,
    pub review_tools: Vec<String>,
    pub review_commands: Vec<String>,
    pub check_timeout: Duration,
    pub setup_script: Option<PathBuf>,
    pub setup_timeout: Duration,
}

impl WorkflowSettings {
    pub fn from_config(cfg: &WardenConfig, base_branch: String) -> Self {
        Self {
            base_branch,
            labels: cfg.labels.clone(),
            agent_timeout: Duration::from_secs(cfg.agent.timeout_secs),
            implement_tools: cfg.agent.implement_tools.clone(),
            review_tools: cfg.agent.review_tools.clone(),
            review_commands: cfg.review_commands.clone(),
            check_timeout: Duration::from_secs(cfg.check_timeout_secs),
            setup_script: cfg.setup_script_path(),
            setup_timeout: Duration::from_secs(cfg.setup_timeout_secs),
        }
    }
}

/// Everything a workflow needs. Shared by all tasks behind an `Arc`.
pub struct WorkflowContext {
    pub store: WorkItemStore,
    pub isolation: IsolationManager,
    pub host: Arc<dyn RepoHost>,
    pub agent: Arc<dyn AgentInvoker>,
    pub settings: WorkflowSettings,
    pub progress: Option<ProgressSink>,
}

/// How a workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEnd {
    Completed { related_number: Option<u64> },
    Failed {
        message: String,
        /// Isolation left on disk for inspection.
        preserved: Option<PathBuf>,
    },
}

impl WorkflowEnd {
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkflowEnd::Completed { .. })
    }
}

impl WorkflowContext {
    /// Lifecycle events are delivered even when the channel is busy.
    pub(crate) async fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.progress {
            sink.deliver(event).await;
        }
    }

    /// Post a comment, logging instead of failing.
    pub(crate) async fn notify(&self, number: u64, body: &str) {
        if let Err(err) = self.host.post_comment(number, body).await {
            warn!(number, err = %err, "failed to post comment");
        }
    }

    /// Swap labels, logging instead of failing.
    pub(crate) async fn relabel(&self, number: u64, remove: &str, add: &str) {
        if let Err(err) = self.host.remove_label(number, remove).await {
            warn!(number, label = remove, err = %err, "failed to remove label");
        }
        if let Err(err) = self.host.add_label(number, add).await {
            warn!(number, label = add, err = %err, "failed to add label");
        }
    }

    /// Run the configured setup script, if any.
    pub(crate) async fn run_setup(
        &self,
        key: ItemKey,
        isolation: &Isolation,
        base_branch: &str,
    ) -> anyhow::Result<()> {
        let Some(script) = &self.settings.setup_script else {
            return Ok(());
        };
        run_setup_script(&SetupContext {
            script: script.clone(),
            parent_repo: self.isolation.repo_path().to_path_buf(),
            worktree: isolation.path.clone(),
            branch: isolation.branch.clone(),
            base_branch: base_branch.to_string(),
            key,
            timeout: self.settings.setup_timeout,
        })
        .await
    }

    async fn cleanup(&self, isolation: &Isolation) {
        if let Err(err) = self.isolation.cleanup(isolation).await {
            warn!(path = %isolation.path.display(), err = %format!("{err:#}"), "failed to clean up isolation");
        }
    }

    /// Recreate the reservation if it was cleared while the workflow ran, so the
    /// terminal status is always recorded.
    fn ensure_record(&self, key: ItemKey) -> anyhow::Result<()> {
        if self.store.get_item(key.kind, key.number)?.is_none() {
            warn!(key = %key, "record missing at finish, recreating");
            self.store.mark_in_progress(key.kind, key.number, None, None)?;
        }
        Ok(())
    }

    /// Terminal success: record completion, then remove the isolation.
    pub(crate) async fn finish_completed(
        &self,
        key: ItemKey,
        isolation: Option<&Isolation>,
        related_number: Option<u64>,
    ) -> WorkflowEnd {
        let marked = self
            .ensure_record(key)
            .and_then(|()| self.store.mark_completed(key.kind, key.number, related_number));
        if let Err(err) = marked {
            error!(key = %key, err = %format!("{err:#}"), "failed to record completion");
        }
        if let Some(isolation) = isolation {
            self.cleanup(isolation).await;
        }
        self.emit(ProgressEvent::Finished {
            key,
            succeeded: true,
        })
        .await;
        info!(key = %key, related = ?related_number, "work item completed");
        WorkflowEnd::Completed { related_number }
    }

    /// Terminal failure: durable `failed` record, best-effort comment, cleanup unless preserved.
    pub(crate) async fn finish_failed(
        &self,
        key: ItemKey,
        message: String,
        isolation: Option<&Isolation>,
        preserve: bool,
        comment: String,
    ) -> WorkflowEnd {
        warn!(key = %key, error = %message, preserve, "work item failed");
        let marked = self
            .ensure_record(key)
            .and_then(|()| self.store.mark_failed(key.kind, key.number, &message));
        if let Err(err) = marked {
            error!(key = %key, err = %format!("{err:#}"), "failed to record failure");
        }

        self.notify(key.number, &comment).await;

        let preserved = match isolation {
            Some(isolation) if preserve => {
                info!(path = %isolation.path.display(), "isolation preserved for inspection");
                Some(isolation.path.clone())
            }
            Some(isolation) => {
                self.cleanup(isolation).await;
                None
            }
            None => None,
        };
        self.emit(ProgressEvent::Finished {
            key,
            succeeded: false,
        })
        .await;
        WorkflowEnd::Failed { message, preserved }
    }
}
