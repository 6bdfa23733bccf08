//! GitHub REST implementation of [`RepoHost`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::io::repo_host::{
    CheckStatus, Comment, CreatePullRequest, HostResult, Issue, PullRequest, RepoHost,
    RepoHostError,
};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;
const MAX_RATE_LIMIT_RETRIES: usize = 3;
/// Never sleep longer than this for one rate-limit window.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

pub struct GithubClient {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    /// Set when the remaining quota hit the floor; requests wait until then.
    pause_until: Mutex<Option<DateTime<Utc>>>,
}

impl GithubClient {
    pub fn new(api_url: &str, repo: &str, token: &str) -> HostResult<Self> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| RepoHostError::Transport(format!("invalid repository '{repo}'")))?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| RepoHostError::Transport(format!("token is not a valid header: {e}")))?;
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static("warden"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| RepoHostError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: name.to_string(),
            pause_until: Mutex::new(None),
        })
    }

    /// `<api>/repos/<owner>/<repo>/<segments...>` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> HostResult<Url> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| RepoHostError::Transport(format!("invalid api_url: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RepoHostError::Transport("api_url cannot be a base".to_string()))?;
            path.pop_if_empty()
                .extend(["repos", self.owner.as_str(), self.repo.as_str()])
                .extend(segments);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> HostResult<T> {
        let body = self.execute(Method::GET, url, None).await?;
        decode(&body)
    }

    /// GET every page of a list endpoint.
    async fn get_paged<T: DeserializeOwned>(&self, url: Url) -> HostResult<Vec<T>> {
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("per_page", &PER_PAGE.to_string())
                .append_pair("page", &page.to_string());
            let items: Vec<T> = self.get_json(page_url).await?;
            let done = items.len() < PER_PAGE;
            all.extend(items);
            if done {
                break;
            }
        }
        Ok(all)
    }

    /// Send one request, waiting out rate limits.
    async fn execute(&self, method: Method, url: Url, body: Option<&Value>) -> HostResult<String> {
        let mut attempt = 0;
        loop {
            self.wait_for_pause().await;
            match self.execute_once(method.clone(), url.clone(), body).await {
                Err(RepoHostError::RateLimited { reset_at }) if attempt < MAX_RATE_LIMIT_RETRIES => {
                    attempt += 1;
                    let wait = wait_duration(reset_at, Utc::now());
                    warn!(reset_at = %reset_at, wait_secs = wait.as_secs(), attempt, "rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }

    async fn execute_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> HostResult<String> {
        debug!(method = %method, url = %url, "github request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RepoHostError::Transport(e.to_string()))?;

        let status = response.status();
        let quota = RateLimitHeaders::from_headers(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| RepoHostError::Transport(format!("response read failed: {e}")))?;

        if let Some(reset_at) = quota.exhausted_reset() {
            info!(reset_at = %reset_at, "rate limit quota nearly exhausted, pausing requests");
            if let Ok(mut pause) = self.pause_until.lock() {
                *pause = Some(reset_at);
            }
        }

        if status.is_success() {
            return Ok(text);
        }
        Err(classify_failure(status, &quota, &text, Utc::now()))
    }

    async fn wait_for_pause(&self) {
        let until = self.pause_until.lock().ok().and_then(|mut pause| pause.take());
        if let Some(until) = until {
            let wait = wait_duration(until, Utc::now());
            if !wait.is_zero() {
                info!(wait_secs = wait.as_secs(), "waiting for rate limit reset");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Rate-limit headers of one response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RateLimitHeaders {
    remaining: Option<u64>,
    reset: Option<i64>,
}

impl RateLimitHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .map(str::to_string)
        };
        Self {
            remaining: read("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset: read("x-ratelimit-reset").and_then(|v| v.parse().ok()),
        }
    }

    fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Reset time when at most one request remains in the window.
    fn exhausted_reset(&self) -> Option<DateTime<Utc>> {
        match self.remaining {
            Some(remaining) if remaining <= 1 => self.reset_at(),
            _ => None,
        }
    }
}

fn classify_failure(
    status: StatusCode,
    quota: &RateLimitHeaders,
    body: &str,
    now: DateTime<Utc>,
) -> RepoHostError {
    let limited_status = status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS;
    let says_rate_limit = body.to_ascii_lowercase().contains("rate limit");
    if limited_status && (quota.remaining == Some(0) || says_rate_limit) {
        let reset_at = quota
            .reset_at()
            .unwrap_or_else(|| now + chrono::Duration::seconds(60));
        return RepoHostError::RateLimited { reset_at };
    }
    RepoHostError::Api {
        status: status.as_u16(),
        message: api_message(body),
    }
}

fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn wait_duration(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let wait = (until - now).to_std().unwrap_or(Duration::ZERO) + Duration::from_secs(1);
    wait.min(MAX_RATE_LIMIT_WAIT)
}

fn decode<T: DeserializeOwned>(body: &str) -> HostResult<T> {
    serde_json::from_str(body).map_err(|e| RepoHostError::Decode(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    #[serde(default)]
    user: Option<ApiUser>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pull_request: Option<Value>,
}

impl From<ApiIssue> for Issue {
    fn from(api: ApiIssue) -> Self {
        Issue {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            labels: api.labels.into_iter().map(|l| l.name).collect(),
            author: api.user.map(|u| u.login).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    name: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    #[serde(default)]
    user: Option<ApiUser>,
    head: ApiRef,
    base: ApiRef,
    #[serde(default)]
    draft: Option<bool>,
    #[serde(default)]
    html_url: String,
}

impl From<ApiPull> for PullRequest {
    fn from(api: ApiPull) -> Self {
        PullRequest {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            labels: api.labels.into_iter().map(|l| l.name).collect(),
            author: api.user.map(|u| u.login).unwrap_or_default(),
            branch: api.head.name,
            base_branch: api.base.name,
            head_sha: api.head.sha,
            draft: api.draft.unwrap_or(false),
            url: api.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    user: Option<ApiUser>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiCombinedStatus {
    state: String,
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    statuses: Vec<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    context: String,
    state: String,
}

fn summarize_status(combined: &ApiCombinedStatus) -> CheckStatus {
    if combined.total_count == 0 {
        return CheckStatus {
            passed: None,
            description: "no status checks reported".to_string(),
        };
    }
    let failing: Vec<&str> = combined
        .statuses
        .iter()
        .filter(|s| s.state == "failure" || s.state == "error")
        .map(|s| s.context.as_str())
        .collect();
    match combined.state.as_str() {
        "success" => CheckStatus {
            passed: Some(true),
            description: format!("{} check(s) passed", combined.total_count),
        },
        "pending" => CheckStatus {
            passed: None,
            description: "checks pending".to_string(),
        },
        _ => CheckStatus {
            passed: Some(false),
            description: if failing.is_empty() {
                format!("checks {}", combined.state)
            } else {
                format!("failing: {}", failing.join(", "))
            },
        },
    }
}

#[async_trait]
impl RepoHost for GithubClient {
    #[instrument(skip_all, fields(label))]
    async fn list_labeled_issues(&self, label: &str) -> HostResult<Vec<Issue>> {
        let mut url = self.endpoint(&["issues"])?;
        url.query_pairs_mut()
            .append_pair("state", "open")
            .append_pair("labels", label);
        let items: Vec<ApiIssue> = self.get_paged(url).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.pull_request.is_none())
            .map(Issue::from)
            .collect())
    }

    async fn list_open_prs(&self) -> HostResult<Vec<PullRequest>> {
        let mut url = self.endpoint(&["pulls"])?;
        url.query_pairs_mut().append_pair("state", "open");
        let items: Vec<ApiPull> = self.get_paged(url).await?;
        Ok(items.into_iter().map(PullRequest::from).collect())
    }

    async fn get_issue(&self, number: u64) -> HostResult<Issue> {
        let api: ApiIssue = self
            .get_json(self.endpoint(&["issues", &number.to_string()])?)
            .await?;
        Ok(api.into())
    }

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest> {
        let api: ApiPull = self
            .get_json(self.endpoint(&["pulls", &number.to_string()])?)
            .await?;
        Ok(api.into())
    }

    async fn get_pr_comments(&self, number: u64) -> HostResult<Vec<Comment>> {
        let url = self.endpoint(&["issues", &number.to_string(), "comments"])?;
        let items: Vec<ApiComment> = self.get_paged(url).await?;
        Ok(items
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                author: c.user.map(|u| u.login).unwrap_or_default(),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }

    #[instrument(skip_all, fields(number))]
    async fn post_comment(&self, number: u64, body: &str) -> HostResult<()> {
        let url = self.endpoint(&["issues", &number.to_string(), "comments"])?;
        self.execute(Method::POST, url, Some(&json!({ "body": body })))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(head = %request.head, base = %request.base))]
    async fn create_pr(&self, request: &CreatePullRequest) -> HostResult<PullRequest> {
        let url = self.endpoint(&["pulls"])?;
        let body = serde_json::to_value(request).map_err(|e| RepoHostError::Decode(e.to_string()))?;
        let text = self.execute(Method::POST, url, Some(&body)).await?;
        let api: ApiPull = decode(&text)?;
        info!(number = api.number, "pull request created");
        Ok(api.into())
    }

    async fn add_label(&self, number: u64, label: &str) -> HostResult<()> {
        let url = self.endpoint(&["issues", &number.to_string(), "labels"])?;
        self.execute(Method::POST, url, Some(&json!({ "labels": [label] })))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> HostResult<()> {
        let url = self.endpoint(&["issues", &number.to_string(), "labels", label])?;
        match self.execute(Method::DELETE, url, None).await {
            Ok(_) => Ok(()),
            Err(RepoHostError::Api { status: 404, .. }) => {
                debug!(number, label, "label not present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_check_status(&self, pr: &PullRequest) -> HostResult<CheckStatus> {
        let url = self.endpoint(&["commits", &pr.head_sha, "status"])?;
        let combined: ApiCombinedStatus = self.get_json(url).await?;
        Ok(summarize_status(&combined))
    }

    fn pull_request_url(&self, number: u64) -> String {
        let web = if self.api_url == "https://api.github.com" {
            "https://github.com".to_string()
        } else {
            // GitHub Enterprise: https://host/api/v3 -> https://host
            self.api_url.trim_end_matches("/api/v3").to_string()
        };
        format!("{web}/{}/{}/pull/{number}", self.owner, self.repo)
    }

    async fn close(&self) {
        debug!("github client closed");
    }
}
