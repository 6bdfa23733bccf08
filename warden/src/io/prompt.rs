//! Prompt rendering for agent runs.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::dispatch::linked_issues;
use crate::core::text::truncate_chars;
use crate::io::repo_host::{Issue, PullRequest};

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

/// Previous review text carried into the next review prompt.
const PREVIOUS_REVIEW_CHARS: usize = 8000;

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("implement", IMPLEMENT_TEMPLATE)
        .expect("implement template should be valid");
    env.add_template("review", REVIEW_TEMPLATE)
        .expect("review template should be valid");
    env
});

#[derive(Debug, Serialize)]
struct IssueContext<'a> {
    number: u64,
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct PrContext<'a> {
    number: u64,
    title: &'a str,
    body: &'a str,
    branch: &'a str,
    base_branch: &'a str,
}

/// Prompt asking the agent to implement `issue` on `branch`.
pub fn render_implement(issue: &Issue, branch: &str, base_branch: &str, resume: bool) -> Result<String> {
    let template = ENGINE.get_template("implement")?;
    let rendered = template.render(context! {
        issue => IssueContext {
            number: issue.number,
            title: issue.title.trim(),
            body: issue.body.trim(),
        },
        branch => branch,
        base_branch => base_branch,
        resume => resume,
    })?;
    Ok(rendered)
}

/// Prompt asking the agent for a read-only review of `pr`.
pub fn render_review(
    pr: &PullRequest,
    checks_report: Option<&str>,
    previous_review: Option<&str>,
) -> Result<String> {
    let template = ENGINE.get_template("review")?;
    let rendered = template.render(context! {
        pr => PrContext {
            number: pr.number,
            title: pr.title.trim(),
            body: pr.body.trim(),
            branch: &pr.branch,
            base_branch: &pr.base_branch,
        },
        linked_issues => linked_issues(&pr.body),
        checks => checks_report.map(str::trim).filter(|s| !s.is_empty()),
        previous_review => previous_review
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_chars(s, PREVIOUS_REVIEW_CHARS)),
    })?;
    Ok(rendered)
}
