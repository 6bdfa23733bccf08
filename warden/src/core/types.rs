//! Shared deterministic types for work-item bookkeeping.
//!
//! These types define the persisted contract of the state file and the keys the
//! coordinator uses to deduplicate work. They must not depend on I/O.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote object a work item tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Implement an issue and open a pull request for it.
    Issue,
    /// Review an open pull request.
    PrReview,
    /// Reserved; no workflow produces it yet, but state files carrying it still load.
    PrMerge,
}

impl WorkItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemKind::Issue => "issue",
            WorkItemKind::PrReview => "pr_review",
            WorkItemKind::PrMerge => "pr_merge",
        }
    }
}

impl fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemKind {
    type Err = anyhow::Error;

    /// Accepts the persisted names plus the CLI synonyms `feature` and `review`/`pr`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issue" | "feature" => Ok(WorkItemKind::Issue),
            "pr_review" | "review" | "pr" => Ok(WorkItemKind::PrReview),
            "pr_merge" | "merge" => Ok(WorkItemKind::PrMerge),
            other => Err(anyhow!(
                "unknown work item kind '{other}' (expected issue, feature, review, pr, or merge)"
            )),
        }
    }
}

/// Lifecycle status of a recorded work item. Absence of a record means pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    InProgress,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
        }
    }
}

/// Unique identity of a work item: `(kind, number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub kind: WorkItemKind,
    pub number: u64,
}

impl ItemKey {
    pub fn new(kind: WorkItemKind, number: u64) -> Self {
        Self { kind, number }
    }

    pub fn issue(number: u64) -> Self {
        Self::new(WorkItemKind::Issue, number)
    }

    pub fn review(number: u64) -> Self {
        Self::new(WorkItemKind::PrReview, number)
    }

    /// Key used in the persisted `work_items` map, e.g. `issue:42`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind, self.number)
    }

    pub fn parse_storage_key(raw: &str) -> Result<Self> {
        let (kind, number) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed work item key '{raw}'"))?;
        let number = number
            .parse::<u64>()
            .map_err(|_| anyhow!("malformed work item number in '{raw}'"))?;
        Ok(Self::new(kind.parse()?, number))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WorkItemKind::Issue => write!(f, "issue #{}", self.number),
            WorkItemKind::PrReview => write!(f, "PR #{} review", self.number),
            WorkItemKind::PrMerge => write!(f, "PR #{} merge", self.number),
        }
    }
}

/// Persisted record for one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_type: WorkItemKind,
    pub number: u64,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Cross-reference, e.g. the pull request opened for an issue.
    #[serde(default)]
    pub related_number: Option<u64>,
}

impl WorkItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.item_type, self.number)
    }

    /// True for records that block re-dispatch (`in_progress` or `completed`).
    pub fn is_processing(&self) -> bool {
        matches!(
            self.status,
            WorkItemStatus::InProgress | WorkItemStatus::Completed
        )
    }
}
