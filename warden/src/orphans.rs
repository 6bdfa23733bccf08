//! `warden worktrees`: list isolations and find the ones nothing owns.
//!
//! Only worktrees under the isolation base directory are warden's. Anything
//! else registered with the repository is listed as external and never pruned.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::types::{WorkItem, WorkItemStatus};
use crate::io::isolation::{Isolation, IsolationManager};
use crate::io::store::WorkItemStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListing {
    pub isolation: Isolation,
    /// Lives under the isolation base directory.
    pub managed: bool,
    /// In-progress or failed record that references this isolation.
    pub owner: Option<WorkItem>,
}

impl WorktreeListing {
    pub fn is_orphan(&self) -> bool {
        self.managed && self.owner.is_none()
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn references(item: &WorkItem, isolation: &Isolation) -> bool {
    if !matches!(item.status, WorkItemStatus::InProgress | WorkItemStatus::Failed) {
        return false;
    }
    let by_path = item
        .worktree_path
        .as_deref()
        .is_some_and(|p| same_path(Path::new(p), &isolation.path));
    let by_branch = !isolation.branch.is_empty()
        && item.branch_name.as_deref() == Some(isolation.branch.as_str());
    by_path || by_branch
}

/// Pair each isolation with the record that owns it, if any.
pub fn classify_worktrees(
    isolations: Vec<Isolation>,
    items: &[WorkItem],
    base_dir: &Path,
) -> Vec<WorktreeListing> {
    let base = canonical(base_dir);
    isolations
        .into_iter()
        .map(|isolation| {
            let managed = canonical(&isolation.path).starts_with(&base);
            let owner = items
                .iter()
                .find(|item| references(item, &isolation))
                .cloned();
            WorktreeListing {
                isolation,
                managed,
                owner,
            }
        })
        .collect()
}

pub async fn list_worktrees(
    manager: &IsolationManager,
    store: &WorkItemStore,
) -> Result<Vec<WorktreeListing>> {
    let isolations = manager.list_all().await?;
    let items = store.items()?;
    Ok(classify_worktrees(isolations, &items, manager.base_dir()))
}

/// Remove every orphaned isolation. Returns the removed paths; failures are
/// logged and skipped.
pub async fn prune_orphans(
    manager: &IsolationManager,
    listings: &[WorktreeListing],
) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for listing in listings.iter().filter(|l| l.is_orphan()) {
        let path = &listing.isolation.path;
        match manager.cleanup_path(path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed orphaned isolation");
                removed.push(path.clone());
            }
            Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "could not remove isolation"),
        }
    }
    removed
}

pub fn render_listings(listings: &[WorktreeListing]) -> String {
    if listings.is_empty() {
        return "No isolations.\n".to_string();
    }
    let mut out = String::new();
    for listing in listings {
        let branch = if listing.isolation.branch.is_empty() {
            "(detached)"
        } else {
            listing.isolation.branch.as_str()
        };
        let owner = match &listing.owner {
            Some(item) => format!("{} ({})", item.key(), item.status.as_str()),
            None if listing.managed => "ORPHAN".to_string(),
            None => "external".to_string(),
        };
        out.push_str(&format!(
            "{}  {branch}  {owner}\n",
            listing.isolation.path.display()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkItemKind;

    fn isolation(path: &str, branch: &str) -> Isolation {
        Isolation {
            path: PathBuf::from(path),
            branch: branch.to_string(),
        }
    }

    fn record(number: u64, status: WorkItemStatus, path: Option<&str>, branch: Option<&str>) -> WorkItem {
        WorkItem {
            item_type: WorkItemKind::Issue,
            number,
            status,
            worktree_path: path.map(str::to_string),
            branch_name: branch.map(str::to_string),
            started_at: None,
            completed_at: None,
            error_message: None,
            related_number: None,
        }
    }

    #[test]
    fn owned_by_path_or_branch_and_completed_records_do_not_count() {
        let isolations = vec![
            isolation("/wt/warden-issue-1", "warden/issue-1"),
            isolation("/wt/warden-issue-2", "warden/issue-2"),
            isolation("/wt/warden-issue-3", "warden/issue-3"),
            isolation("/home/dev/scratch", "feature/mine"),
        ];
        let items = vec![
            record(1, WorkItemStatus::InProgress, Some("/wt/warden-issue-1"), None),
            record(2, WorkItemStatus::Failed, None, Some("warden/issue-2")),
            record(3, WorkItemStatus::Completed, Some("/wt/warden-issue-3"), Some("warden/issue-3")),
        ];
        let listings = classify_worktrees(isolations, &items, Path::new("/wt"));
        let orphans: Vec<bool> = listings.iter().map(WorktreeListing::is_orphan).collect();
        assert_eq!(orphans, vec![false, false, true, false]);

        let text = render_listings(&listings);
        assert!(text.contains("issue #1 (in_progress)"));
        assert!(text.contains("/wt/warden-issue-3  warden/issue-3  ORPHAN"));
        assert!(text.contains("/home/dev/scratch  feature/mine  external"));
    }
}
