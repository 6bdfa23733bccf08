//! `warden status`: grouped summary of the state file.

use anyhow::Result;

use crate::core::text::one_line;
use crate::core::types::{WorkItem, WorkItemStatus};
use crate::io::store::WorkItemStore;

/// Completed items listed, newest first.
pub const RECENT_COMPLETED: usize = 10;
const ERROR_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub in_progress: Vec<WorkItem>,
    pub failed: Vec<WorkItem>,
    /// At most [`RECENT_COMPLETED`], newest first.
    pub recent_completed: Vec<WorkItem>,
    pub completed_total: usize,
}

/// Group records by status. In-progress sorts oldest first; failed and
/// completed sort newest first.
pub fn build_report(items: Vec<WorkItem>) -> StatusReport {
    let mut in_progress = Vec::new();
    let mut failed = Vec::new();
    let mut completed = Vec::new();
    for item in items {
        match item.status {
            WorkItemStatus::InProgress => in_progress.push(item),
            WorkItemStatus::Failed => failed.push(item),
            WorkItemStatus::Completed => completed.push(item),
        }
    }
    in_progress.sort_by_key(|item| item.started_at);
    failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    let completed_total = completed.len();
    completed.truncate(RECENT_COMPLETED);
    StatusReport {
        in_progress,
        failed,
        recent_completed: completed,
        completed_total,
    }
}

pub fn load_report(store: &WorkItemStore) -> Result<StatusReport> {
    Ok(build_report(store.items()?))
}

fn label(item: &WorkItem) -> String {
    item.key().to_string()
}

pub fn render_report(report: &StatusReport) -> String {
    let mut out = String::new();
    if report.in_progress.is_empty() && report.failed.is_empty() && report.completed_total == 0 {
        out.push_str("No work items recorded.\n");
        return out;
    }

    out.push_str(&format!("In progress ({}):\n", report.in_progress.len()));
    for item in &report.in_progress {
        let since = item
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!("  {:<18} since {since}", label(item)));
        if let Some(branch) = &item.branch_name {
            out.push_str(&format!("  [{branch}]"));
        }
        out.push('\n');
    }

    out.push_str(&format!("Failed ({}):\n", report.failed.len()));
    for item in &report.failed {
        let error = item
            .error_message
            .as_deref()
            .map(|e| one_line(e, ERROR_CHARS))
            .unwrap_or_default();
        out.push_str(&format!("  {:<18} {error}\n", label(item)));
        if let Some(path) = &item.worktree_path {
            out.push_str(&format!("  {:<18} worktree: {path}\n", ""));
        }
    }

    out.push_str(&format!(
        "Completed ({}, showing {}):\n",
        report.completed_total,
        report.recent_completed.len()
    ));
    for item in &report.recent_completed {
        out.push_str(&format!("  {}", label(item)));
        if let Some(related) = item.related_number {
            out.push_str(&format!(" -> PR #{related}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::types::WorkItemKind;

    fn item(kind: WorkItemKind, number: u64, status: WorkItemStatus, minute: u32) -> WorkItem {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).single();
        WorkItem {
            item_type: kind,
            number,
            status,
            worktree_path: None,
            branch_name: None,
            started_at: at,
            completed_at: (status != WorkItemStatus::InProgress).then_some(at).flatten(),
            error_message: None,
            related_number: None,
        }
    }

    #[test]
    fn groups_by_status_and_caps_completed() {
        let mut items: Vec<WorkItem> = (0..12)
            .map(|n| item(WorkItemKind::Issue, n, WorkItemStatus::Completed, n as u32))
            .collect();
        items.push(item(WorkItemKind::PrReview, 50, WorkItemStatus::InProgress, 0));
        items.push(item(WorkItemKind::Issue, 60, WorkItemStatus::Failed, 0));

        let report = build_report(items);
        assert_eq!(report.in_progress.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.completed_total, 12);
        assert_eq!(report.recent_completed.len(), RECENT_COMPLETED);
        // Newest first.
        assert_eq!(report.recent_completed[0].number, 11);
    }

    #[test]
    fn render_shows_errors_and_related_prs() {
        let mut failed = item(WorkItemKind::Issue, 3, WorkItemStatus::Failed, 1);
        failed.error_message = Some("push rejected\nremote: denied".to_string());
        failed.worktree_path = Some("/tmp/wt/warden-issue-3".to_string());
        let mut done = item(WorkItemKind::Issue, 4, WorkItemStatus::Completed, 2);
        done.related_number = Some(17);

        let text = render_report(&build_report(vec![failed, done]));
        assert!(text.contains("Failed (1):"));
        assert!(text.contains("issue #3"));
        assert!(text.contains("push rejected"));
        assert!(!text.contains("push rejected\n"));
        assert!(text.contains("worktree: /tmp/wt/warden-issue-3"));
        assert!(text.contains("issue #4 -> PR #17"));
    }

    #[test]
    fn render_empty_store() {
        assert_eq!(
            render_report(&build_report(Vec::new())),
            "No work items recorded.\n"
        );
    }
}
