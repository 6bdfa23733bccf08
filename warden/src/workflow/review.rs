//! Review workflow: check out the PR head, run checks, ask the agent for a
//! read-only review, post it as one comment.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::activity::ProgressEvent;
use crate::core::comments;
use crate::core::text::truncate_chars;
use crate::core::types::{ItemKey, WorkItemKind};
use crate::io::agent::AgentRequest;
use crate::io::isolation::Isolation;
use crate::io::prompt::render_review;
use crate::io::repo_host::PullRequest;
use crate::workflow::{WorkflowContext, WorkflowEnd};

const FAILURE_SUMMARY_CHARS: usize = 500;

#[derive(Debug)]
enum ReviewState {
    Init,
    Reserved,
    IsolationReady {
        isolation: Isolation,
    },
    SetupDone {
        isolation: Isolation,
    },
    ChecksRun {
        isolation: Isolation,
        checks_report: Option<String>,
    },
    AgentRan {
        isolation: Isolation,
        checks_report: Option<String>,
        review: String,
    },
    Completed {
        isolation: Option<Isolation>,
    },
    Failed {
        message: String,
        isolation: Option<Isolation>,
    },
}

impl ReviewState {
    fn isolation(&self) -> Option<&Isolation> {
        match self {
            ReviewState::IsolationReady { isolation }
            | ReviewState::SetupDone { isolation }
            | ReviewState::ChecksRun { isolation, .. }
            | ReviewState::AgentRan { isolation, .. } => Some(isolation),
            ReviewState::Completed { isolation } | ReviewState::Failed { isolation, .. } => {
                isolation.as_ref()
            }
            ReviewState::Init | ReviewState::Reserved => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ReviewState::Init => "init",
            ReviewState::Reserved => "reserved",
            ReviewState::IsolationReady { .. } => "isolation_ready",
            ReviewState::SetupDone { .. } => "setup_done",
            ReviewState::ChecksRun { .. } => "checks_run",
            ReviewState::AgentRan { .. } => "agent_ran",
            ReviewState::Completed { .. } => "completed",
            ReviewState::Failed { .. } => "failed",
        }
    }
}

/// Drive one PR review to a terminal state. The isolation is always removed.
#[instrument(skip_all, fields(pr = pr.number))]
pub async fn run_review_workflow(ctx: &WorkflowContext, pr: &PullRequest) -> WorkflowEnd {
    let key = ItemKey::review(pr.number);
    let mut state = ReviewState::Init;
    loop {
        state = match state {
            ReviewState::Completed { isolation } => {
                return ctx.finish_completed(key, isolation.as_ref(), None).await;
            }
            ReviewState::Failed { message, isolation } => {
                let comment = comments::review_failed(&message);
                return ctx
                    .finish_failed(key, message, isolation.as_ref(), false, comment)
                    .await;
            }
            other => advance(ctx, pr, other).await,
        };
        debug!(state = state.name(), "review workflow transition");
    }
}

async fn advance(ctx: &WorkflowContext, pr: &PullRequest, state: ReviewState) -> ReviewState {
    let isolation = state.isolation().cloned();
    match step(ctx, pr, state).await {
        Ok(next) => next,
        Err(err) => ReviewState::Failed {
            message: format!("{err:#}"),
            isolation,
        },
    }
}

fn base_branch<'a>(ctx: &'a WorkflowContext, pr: &'a PullRequest) -> &'a str {
    if pr.base_branch.is_empty() {
        &ctx.settings.base_branch
    } else {
        &pr.base_branch
    }
}

async fn step(ctx: &WorkflowContext, pr: &PullRequest, state: ReviewState) -> Result<ReviewState> {
    let key = ItemKey::review(pr.number);
    let base = base_branch(ctx, pr);
    match state {
        ReviewState::Init => {
            ctx.store
                .mark_in_progress(WorkItemKind::PrReview, pr.number, None, Some(&pr.branch))?;
            ctx.emit(ProgressEvent::Started {
                key,
                title: pr.title.clone(),
                branch: Some(pr.branch.clone()),
            })
            .await;
            Ok(ReviewState::Reserved)
        }
        ReviewState::Reserved => {
            ctx.notify(pr.number, &comments::review_started()).await;
            let isolation = ctx
                .isolation
                .create(&pr.branch, base, true)
                .await
                .context("create isolation")?;
            ctx.store.mark_in_progress(
                WorkItemKind::PrReview,
                pr.number,
                Some(&isolation.path),
                Some(&pr.branch),
            )?;
            Ok(ReviewState::IsolationReady { isolation })
        }
        ReviewState::IsolationReady { isolation } => {
            ctx.run_setup(key, &isolation, base).await?;
            Ok(ReviewState::SetupDone { isolation })
        }
        ReviewState::SetupDone { isolation } => {
            let commands = &ctx.settings.review_commands;
            let checks_report = if commands.is_empty() {
                None
            } else {
                let (passed, report) = ctx
                    .agent
                    .run_checks(commands, &isolation.path, ctx.settings.check_timeout)
                    .await;
                info!(passed, "review checks finished");
                Some(report)
            };
            Ok(ReviewState::ChecksRun {
                isolation,
                checks_report,
            })
        }
        ReviewState::ChecksRun {
            isolation,
            checks_report,
        } => {
            let previous = previous_review(ctx, pr.number).await;
            let prompt = render_review(pr, checks_report.as_deref(), previous.as_deref())?;
            let outcome = ctx
                .agent
                .invoke(AgentRequest {
                    key,
                    prompt,
                    workdir: isolation.path.clone(),
                    allowed_tools: ctx.settings.review_tools.clone(),
                    timeout: ctx.settings.agent_timeout,
                    progress: ctx.progress.clone(),
                })
                .await?;
            if !outcome.succeeded {
                return Ok(ReviewState::Failed {
                    message: format!(
                        "Review failed: {}",
                        truncate_chars(&outcome.summary, FAILURE_SUMMARY_CHARS)
                    ),
                    isolation: Some(isolation),
                });
            }
            Ok(ReviewState::AgentRan {
                isolation,
                checks_report,
                review: outcome.summary,
            })
        }
        ReviewState::AgentRan {
            isolation,
            checks_report,
            review,
        } => {
            let ci = ci_status_line(ctx, pr).await;
            let body = comments::review_comment(&review, checks_report.as_deref(), ci.as_deref());
            ctx.host
                .post_comment(pr.number, &body)
                .await
                .context("post review comment")?;
            let labels = &ctx.settings.labels;
            ctx.relabel(pr.number, &labels.trigger, &labels.reviewed).await;
            Ok(ReviewState::Completed {
                isolation: Some(isolation),
            })
        }
        ReviewState::Completed { .. } | ReviewState::Failed { .. } => Ok(state),
    }
}

/// Body of the most recent automated review on the PR, if any.
async fn previous_review(ctx: &WorkflowContext, number: u64) -> Option<String> {
    match ctx.host.get_pr_comments(number).await {
        Ok(thread) => thread
            .into_iter()
            .rev()
            .find(|c| comments::is_automated_review(&c.body))
            .map(|c| c.body),
        Err(err) => {
            warn!(pr = number, err = %err, "could not fetch previous reviews");
            None
        }
    }
}

/// One-line remote CI status, or `None` when it cannot be determined.
async fn ci_status_line(ctx: &WorkflowContext, pr: &PullRequest) -> Option<String> {
    match ctx.host.get_check_status(pr).await {
        Ok(status) => {
            let verdict = match status.passed {
                Some(true) => "✅ passing",
                Some(false) => "❌ failing",
                None => "⏳ pending",
            };
            if status.description.trim().is_empty() {
                Some(verdict.to_string())
            } else {
                Some(format!("{verdict} ({})", status.description.trim()))
            }
        }
        Err(err) => {
            warn!(pr = pr.number, err = %err, "could not fetch CI status");
            None
        }
    }
}
