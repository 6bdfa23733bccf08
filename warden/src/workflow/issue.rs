//! Issue workflow: isolation on `warden/issue-<n>`, agent run, PR publication.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::activity::ProgressEvent;
use crate::core::comments;
use crate::core::lifecycle::{ChangeSet, classify_change_set, issue_branch};
use crate::core::outcome::Outcome;
use crate::core::text::{NO_RESULT_PLACEHOLDER, truncate_chars};
use crate::core::types::{ItemKey, WorkItemKind};
use crate::io::agent::AgentRequest;
use crate::io::isolation::Isolation;
use crate::io::prompt::render_implement;
use crate::io::repo_host::{CreatePullRequest, Issue};
use crate::workflow::{WorkflowContext, WorkflowEnd};

const FAILURE_SUMMARY_CHARS: usize = 500;

#[derive(Debug)]
enum IssueState {
    Init,
    BranchResolved {
        branch: String,
        resume: bool,
    },
    Reserved {
        branch: String,
        resume: bool,
    },
    IsolationReady {
        isolation: Isolation,
        resume: bool,
    },
    SetupDone {
        isolation: Isolation,
        resume: bool,
    },
    AgentRan {
        isolation: Isolation,
        outcome: Outcome,
    },
    Completed {
        isolation: Option<Isolation>,
        related_number: Option<u64>,
    },
    Failed {
        message: String,
        isolation: Option<Isolation>,
        preserve: bool,
    },
}

impl IssueState {
    fn isolation(&self) -> Option<&Isolation> {
        match self {
            IssueState::IsolationReady { isolation, .. }
            | IssueState::SetupDone { isolation, .. }
            | IssueState::AgentRan { isolation, .. } => Some(isolation),
            IssueState::Completed { isolation, .. } | IssueState::Failed { isolation, .. } => {
                isolation.as_ref()
            }
            IssueState::Init
            | IssueState::BranchResolved { .. }
            | IssueState::Reserved { .. } => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            IssueState::Init => "init",
            IssueState::BranchResolved { .. } => "branch_resolved",
            IssueState::Reserved { .. } => "reserved",
            IssueState::IsolationReady { .. } => "isolation_ready",
            IssueState::SetupDone { .. } => "setup_done",
            IssueState::AgentRan { .. } => "agent_ran",
            IssueState::Completed { .. } => "completed",
            IssueState::Failed { .. } => "failed",
        }
    }
}

/// Drive one issue to a terminal state. Never returns an error: failures are
/// recorded in the store and reported on the issue.
#[instrument(skip_all, fields(issue = issue.number))]
pub async fn run_issue_workflow(ctx: &WorkflowContext, issue: &Issue) -> WorkflowEnd {
    let key = ItemKey::issue(issue.number);
    let mut state = IssueState::Init;
    loop {
        state = match state {
            IssueState::Completed {
                isolation,
                related_number,
            } => {
                return ctx
                    .finish_completed(key, isolation.as_ref(), related_number)
                    .await;
            }
            IssueState::Failed {
                message,
                isolation,
                preserve,
            } => {
                let comment = comments::issue_failed(&message);
                return ctx
                    .finish_failed(key, message, isolation.as_ref(), preserve, comment)
                    .await;
            }
            other => advance(ctx, issue, other).await,
        };
        debug!(state = state.name(), "issue workflow transition");
    }
}

async fn advance(ctx: &WorkflowContext, issue: &Issue, state: IssueState) -> IssueState {
    let isolation = state.isolation().cloned();
    match step(ctx, issue, state).await {
        Ok(next) => next,
        Err(err) => IssueState::Failed {
            message: format!("{err:#}"),
            isolation,
            preserve: false,
        },
    }
}

async fn step(ctx: &WorkflowContext, issue: &Issue, state: IssueState) -> Result<IssueState> {
    let key = ItemKey::issue(issue.number);
    let base = ctx.settings.base_branch.as_str();
    match state {
        IssueState::Init => {
            let branch = issue_branch(issue.number);
            let resume = ctx.isolation.branch_exists(&branch).await?;
            if resume {
                info!(branch = %branch, "branch already exists, resuming");
            }
            Ok(IssueState::BranchResolved { branch, resume })
        }
        IssueState::BranchResolved { branch, resume } => {
            ctx.store
                .mark_in_progress(WorkItemKind::Issue, issue.number, None, Some(&branch))?;
            ctx.emit(ProgressEvent::Started {
                key,
                title: issue.title.clone(),
                branch: Some(branch.clone()),
            })
            .await;
            Ok(IssueState::Reserved { branch, resume })
        }
        IssueState::Reserved { branch, resume } => {
            let isolation = ctx
                .isolation
                .create(&branch, base, resume)
                .await
                .context("create isolation")?;
            ctx.store.mark_in_progress(
                WorkItemKind::Issue,
                issue.number,
                Some(&isolation.path),
                Some(&branch),
            )?;
            Ok(IssueState::IsolationReady { isolation, resume })
        }
        IssueState::IsolationReady { isolation, resume } => {
            match ctx.run_setup(key, &isolation, base).await {
                Ok(()) => Ok(IssueState::SetupDone { isolation, resume }),
                Err(err) => Ok(IssueState::Failed {
                    message: format!("{err:#}"),
                    isolation: Some(isolation),
                    preserve: true,
                }),
            }
        }
        IssueState::SetupDone { isolation, resume } => {
            ctx.notify(issue.number, &comments::issue_started(resume)).await;
            let prompt = render_implement(issue, &isolation.branch, base, resume)?;
            let outcome = ctx
                .agent
                .invoke(AgentRequest {
                    key,
                    prompt,
                    workdir: isolation.path.clone(),
                    allowed_tools: ctx.settings.implement_tools.clone(),
                    timeout: ctx.settings.agent_timeout,
                    progress: ctx.progress.clone(),
                })
                .await?;
            if !outcome.succeeded {
                return Ok(IssueState::Failed {
                    message: format!(
                        "Implementation failed: {}",
                        truncate_chars(&outcome.summary, FAILURE_SUMMARY_CHARS)
                    ),
                    isolation: Some(isolation),
                    preserve: false,
                });
            }
            Ok(IssueState::AgentRan { isolation, outcome })
        }
        IssueState::AgentRan { isolation, outcome } => {
            let ahead = ctx.isolation.has_commits_ahead(&isolation, base).await?;
            let dirty = ctx.isolation.has_uncommitted_changes(&isolation).await?;
            match classify_change_set(ahead, dirty) {
                ChangeSet::NoChanges => {
                    ctx.notify(issue.number, &comments::issue_no_changes(&outcome.summary))
                        .await;
                    let labels = &ctx.settings.labels;
                    ctx.relabel(issue.number, &labels.trigger, &labels.done).await;
                    Ok(IssueState::Completed {
                        isolation: Some(isolation),
                        related_number: None,
                    })
                }
                ChangeSet::Uncommitted => {
                    let status = ctx.isolation.get_uncommitted_status(&isolation).await?;
                    Ok(IssueState::Failed {
                        message: comments::uncommitted_changes(&status),
                        isolation: Some(isolation),
                        preserve: true,
                    })
                }
                ChangeSet::Committed => {
                    let pr_number = publish(ctx, issue, &isolation, &outcome).await?;
                    Ok(IssueState::Completed {
                        isolation: Some(isolation),
                        related_number: Some(pr_number),
                    })
                }
            }
        }
        IssueState::Completed { .. } | IssueState::Failed { .. } => Ok(state),
    }
}

/// Push the branch, open the PR, flip labels, announce. Returns the PR number.
async fn publish(
    ctx: &WorkflowContext,
    issue: &Issue,
    isolation: &Isolation,
    outcome: &Outcome,
) -> Result<u64> {
    let base = ctx.settings.base_branch.as_str();
    let summary = if outcome.summary == NO_RESULT_PLACEHOLDER {
        let subjects = ctx.isolation.commit_subjects(isolation, base).await?;
        summary_from_subjects(&subjects)
    } else {
        outcome.summary.clone()
    };

    ctx.isolation
        .push_branch(isolation, &isolation.branch)
        .await
        .context("push branch")?;
    let pr = ctx
        .host
        .create_pr(&CreatePullRequest {
            title: comments::pr_title(issue.number, &issue.title),
            body: comments::pr_body(issue.number, &summary),
            head: isolation.branch.clone(),
            base: base.to_string(),
        })
        .await
        .context("create pull request")?;
    info!(pr = pr.number, "pull request opened");

    let labels = &ctx.settings.labels;
    if let Err(err) = ctx.host.add_label(pr.number, &labels.trigger).await {
        warn!(pr = pr.number, err = %err, "failed to label pull request for review");
    }
    ctx.relabel(issue.number, &labels.trigger, &labels.done).await;

    let url = if pr.url.is_empty() {
        ctx.host.pull_request_url(pr.number)
    } else {
        pr.url.clone()
    };
    ctx.notify(issue.number, &comments::issue_completed(&summary, &url))
        .await;
    Ok(pr.number)
}

/// Bullet list of commit subjects, or the placeholder when there are none.
fn summary_from_subjects(subjects: &[String]) -> String {
    let lines: Vec<String> = subjects
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| format!("- {s}"))
        .collect();
    if lines.is_empty() {
        NO_RESULT_PLACEHOLDER.to_string()
    } else {
        lines.join("\n")
    }
}
