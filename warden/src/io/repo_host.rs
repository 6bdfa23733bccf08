//! Remote repository host abstraction.
//!
//! The [`RepoHost`] trait decouples workflows from the hosting service's API.
//! Production uses [`crate::io::github::GithubClient`]; tests use an in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoHostError {
    /// The API quota is exhausted until `reset_at`.
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("API request failed: {0}")]
    Transport(String),
    #[error("API response was malformed: {0}")]
    Decode(String),
}

pub type HostResult<T> = Result<T, RepoHostError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    /// Head branch name.
    pub branch: String,
    pub base_branch: String,
    pub head_sha: String,
    pub draft: bool,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    /// Head branch.
    pub head: String,
    /// Base branch.
    pub base: String,
}

/// Combined CI status of a PR head commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStatus {
    /// `None` while checks are pending or absent.
    pub passed: Option<bool>,
    pub description: String,
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Open issues carrying `label`, excluding pull requests.
    async fn list_labeled_issues(&self, label: &str) -> HostResult<Vec<Issue>>;

    /// Open pull requests, drafts included.
    async fn list_open_prs(&self) -> HostResult<Vec<PullRequest>>;

    async fn get_issue(&self, number: u64) -> HostResult<Issue>;

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest>;

    /// Issue-style comments on a PR, oldest first.
    async fn get_pr_comments(&self, number: u64) -> HostResult<Vec<Comment>>;

    async fn post_comment(&self, number: u64, body: &str) -> HostResult<()>;

    async fn create_pr(&self, request: &CreatePullRequest) -> HostResult<PullRequest>;

    async fn add_label(&self, number: u64, label: &str) -> HostResult<()>;

    /// Removing a label that is not present is not an error.
    async fn remove_label(&self, number: u64, label: &str) -> HostResult<()>;

    async fn get_check_status(&self, pr: &PullRequest) -> HostResult<CheckStatus>;

    /// Browser URL of issue or PR `number`.
    fn pull_request_url(&self, number: u64) -> String;

    /// Release client resources. Default: nothing to release.
    async fn close(&self) {}
}
