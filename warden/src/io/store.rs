//! Durable work-item state (`.warden/state.json`).
//!
//! Every mutation rewrites the whole snapshot through temp file + rename while
//! holding the store lock, so concurrent workflows never interleave a
//! read-modify-write and a crash leaves either the old or the new snapshot.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::{ItemKey, WorkItem, WorkItemKind, WorkItemStatus};

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    #[serde(default)]
    pub work_items: BTreeMap<String, WorkItem>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Process-wide owner of the state file.
#[derive(Debug)]
pub struct WorkItemStore {
    path: PathBuf,
    state: Mutex<StateSnapshot>,
}

impl WorkItemStore {
    /// Open the store, loading the last snapshot.
    ///
    /// A missing file is empty state. A corrupt or unreadable file is logged and
    /// also treated as empty state.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match load_snapshot(&path) {
            Ok(Some(snapshot)) => {
                debug!(path = %path.display(), items = snapshot.work_items.len(), "state loaded");
                snapshot
            }
            Ok(None) => StateSnapshot::default(),
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "state file unreadable, starting empty");
                StateSnapshot::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processing(&self, kind: WorkItemKind, number: u64) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .work_items
            .get(&ItemKey::new(kind, number).storage_key())
            .is_some_and(WorkItem::is_processing))
    }

    pub fn is_in_progress(&self, kind: WorkItemKind, number: u64) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .work_items
            .get(&ItemKey::new(kind, number).storage_key())
            .is_some_and(|item| item.status == WorkItemStatus::InProgress))
    }

    /// Reserve (or refresh) a work item as `in_progress` and persist it.
    ///
    /// Re-marking an item that is already `in_progress` keeps its original
    /// `started_at`, and `None` arguments keep previously attached values.
    pub fn mark_in_progress(
        &self,
        kind: WorkItemKind,
        number: u64,
        worktree_path: Option<&Path>,
        branch_name: Option<&str>,
    ) -> Result<WorkItem> {
        let key = ItemKey::new(kind, number).storage_key();
        let mut state = self.lock()?;
        let previous = state
            .work_items
            .get(&key)
            .filter(|item| item.status == WorkItemStatus::InProgress)
            .cloned();
        let item = WorkItem {
            item_type: kind,
            number,
            status: WorkItemStatus::InProgress,
            worktree_path: worktree_path
                .map(|p| p.display().to_string())
                .or_else(|| previous.as_ref().and_then(|p| p.worktree_path.clone())),
            branch_name: branch_name
                .map(str::to_string)
                .or_else(|| previous.as_ref().and_then(|p| p.branch_name.clone())),
            started_at: previous
                .as_ref()
                .and_then(|p| p.started_at)
                .or_else(|| Some(Utc::now())),
            completed_at: None,
            error_message: None,
            related_number: None,
        };
        state.work_items.insert(key.clone(), item.clone());
        self.persist(&mut state)?;
        debug!(key = %key, "marked in progress");
        Ok(item)
    }

    pub fn mark_completed(
        &self,
        kind: WorkItemKind,
        number: u64,
        related_number: Option<u64>,
    ) -> Result<()> {
        self.finish(kind, number, |item| {
            item.status = WorkItemStatus::Completed;
            item.related_number = related_number;
            item.error_message = None;
        })
    }

    pub fn mark_failed(&self, kind: WorkItemKind, number: u64, error_message: &str) -> Result<()> {
        let message = error_message.to_string();
        self.finish(kind, number, move |item| {
            item.status = WorkItemStatus::Failed;
            item.error_message = Some(message);
        })
    }

    fn finish(
        &self,
        kind: WorkItemKind,
        number: u64,
        update: impl FnOnce(&mut WorkItem),
    ) -> Result<()> {
        let key = ItemKey::new(kind, number).storage_key();
        let mut state = self.lock()?;
        let Some(item) = state.work_items.get_mut(&key) else {
            warn!(key = %key, "no record to finish, ignoring");
            return Ok(());
        };
        update(item);
        item.completed_at = Some(Utc::now());
        let status = item.status;
        self.persist(&mut state)?;
        debug!(key = %key, status = status.as_str(), "work item finished");
        Ok(())
    }

    /// Delete a record regardless of status. Returns whether one existed.
    pub fn clear_item(&self, kind: WorkItemKind, number: u64) -> Result<bool> {
        let key = ItemKey::new(kind, number).storage_key();
        let mut state = self.lock()?;
        if state.work_items.remove(&key).is_none() {
            return Ok(false);
        }
        self.persist(&mut state)?;
        info!(key = %key, "cleared work item");
        Ok(true)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let count = state.work_items.len();
        state.work_items.clear();
        self.persist(&mut state)?;
        info!(count, "cleared all work items");
        Ok(count)
    }

    pub fn get_in_progress_count(&self) -> Result<usize> {
        Ok(self.in_progress_keys()?.len())
    }

    pub fn in_progress_keys(&self) -> Result<Vec<ItemKey>> {
        let state = self.lock()?;
        Ok(state
            .work_items
            .values()
            .filter(|item| item.status == WorkItemStatus::InProgress)
            .map(WorkItem::key)
            .collect())
    }

    pub fn get_item(&self, kind: WorkItemKind, number: u64) -> Result<Option<WorkItem>> {
        let state = self.lock()?;
        Ok(state
            .work_items
            .get(&ItemKey::new(kind, number).storage_key())
            .cloned())
    }

    /// Snapshot of every record.
    pub fn items(&self) -> Result<Vec<WorkItem>> {
        let state = self.lock()?;
        Ok(state.work_items.values().cloned().collect())
    }

    /// Forget every `in_progress` record so interrupted work is re-evaluated.
    ///
    /// Called once at startup; whatever was running died with the previous process.
    pub fn reset_in_progress_items(&self) -> Result<usize> {
        self.remove_in_progress_where(|_| true)
    }

    /// Remove `in_progress` records started more than `max_age_hours` ago.
    /// Keys in `live` are skipped: their workflow is still running and will
    /// finish the record itself.
    pub fn cleanup_stale_items(&self, max_age_hours: u64, live: &HashSet<ItemKey>) -> Result<usize> {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.remove_in_progress_where(|item| {
            !live.contains(&item.key()) && item.started_at.is_none_or(|at| at < cutoff)
        })
    }

    fn remove_in_progress_where(&self, predicate: impl Fn(&WorkItem) -> bool) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.work_items.len();
        state
            .work_items
            .retain(|_, item| !(item.status == WorkItemStatus::InProgress && predicate(item)));
        let removed = before - state.work_items.len();
        if removed > 0 {
            self.persist(&mut state)?;
            info!(removed, "removed in-progress records");
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StateSnapshot>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("work item store lock poisoned"))
    }

    fn persist(&self, state: &mut StateSnapshot) -> Result<()> {
        state.last_updated = Some(Utc::now());
        let mut buf = serde_json::to_string_pretty(&*state).context("serialize state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn load_snapshot(path: &Path) -> Result<Option<StateSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    Ok(Some(snapshot))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkItemKind::{Issue, PrReview};

    fn store_in(dir: &Path) -> WorkItemStore {
        WorkItemStore::open(dir.join("state.json"))
    }

    /// Verifies a reservation survives a reopen (durability).
    #[test]
    fn in_progress_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store
            .mark_in_progress(Issue, 42, None, Some("warden/issue-42"))
            .expect("mark");

        let reopened = store_in(temp.path());
        assert!(reopened.is_in_progress(Issue, 42).expect("query"));
        let item = reopened.get_item(Issue, 42).expect("get").expect("item");
        assert_eq!(item.branch_name.as_deref(), Some("warden/issue-42"));
        assert!(item.started_at.is_some());
    }

    #[test]
    fn is_processing_covers_in_progress_and_completed_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        assert!(!store.is_processing(Issue, 1).expect("query"));

        store.mark_in_progress(Issue, 1, None, None).expect("mark");
        assert!(store.is_processing(Issue, 1).expect("query"));

        store.mark_completed(Issue, 1, Some(9)).expect("complete");
        assert!(store.is_processing(Issue, 1).expect("query"));
        assert!(!store.is_in_progress(Issue, 1).expect("query"));

        store.mark_in_progress(Issue, 2, None, None).expect("mark");
        store.mark_failed(Issue, 2, "boom").expect("fail");
        assert!(!store.is_processing(Issue, 2).expect("query"));
        let failed = store.get_item(Issue, 2).expect("get").expect("item");
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn keys_are_scoped_by_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_in_progress(Issue, 5, None, None).expect("mark");
        assert!(!store.is_processing(PrReview, 5).expect("query"));
    }

    /// Re-marking keeps the first `started_at` and previously attached fields.
    #[test]
    fn re_marking_in_progress_preserves_start_and_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let first = store
            .mark_in_progress(Issue, 3, None, Some("warden/issue-3"))
            .expect("mark");
        let second = store
            .mark_in_progress(Issue, 3, Some(Path::new("/tmp/wt")), None)
            .expect("mark again");
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.branch_name.as_deref(), Some("warden/issue-3"));
        assert_eq!(second.worktree_path.as_deref(), Some("/tmp/wt"));
    }

    #[test]
    fn finishing_a_missing_record_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_completed(Issue, 77, None).expect("complete");
        store.mark_failed(Issue, 77, "x").expect("fail");
        assert!(store.get_item(Issue, 77).expect("get").is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        let store = WorkItemStore::open(&path);
        assert!(store.items().expect("items").is_empty());

        store.mark_in_progress(Issue, 1, None, None).expect("mark");
        assert_eq!(WorkItemStore::open(&path).items().expect("items").len(), 1);
    }

    #[test]
    fn reset_removes_only_in_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_in_progress(Issue, 1, None, None).expect("mark");
        store.mark_in_progress(Issue, 2, None, None).expect("mark");
        store.mark_completed(Issue, 2, None).expect("complete");
        store.mark_in_progress(PrReview, 3, None, None).expect("mark");

        assert_eq!(store.reset_in_progress_items().expect("reset"), 2);
        assert_eq!(store.get_in_progress_count().expect("count"), 0);
        assert!(store.is_processing(Issue, 2).expect("query"));
        assert!(!store.is_processing(Issue, 1).expect("query"));
    }

    #[test]
    fn stale_cleanup_uses_started_at() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let old = Utc::now() - Duration::hours(30);
        let snapshot = StateSnapshot {
            work_items: BTreeMap::from([(
                "issue:8".to_string(),
                WorkItem {
                    item_type: Issue,
                    number: 8,
                    status: WorkItemStatus::InProgress,
                    worktree_path: None,
                    branch_name: None,
                    started_at: Some(old),
                    completed_at: None,
                    error_message: None,
                    related_number: None,
                },
            )]),
            last_updated: None,
        };
        fs::write(&path, serde_json::to_string(&snapshot).expect("json")).expect("write");

        let store = WorkItemStore::open(&path);
        store.mark_in_progress(Issue, 9, None, None).expect("mark");
        assert_eq!(store.cleanup_stale_items(24, &HashSet::new()).expect("cleanup"), 1);
        assert!(store.is_in_progress(Issue, 9).expect("query"));
        assert!(!store.is_in_progress(Issue, 8).expect("query"));
    }

    #[test]
    fn stale_cleanup_skips_live_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_in_progress(Issue, 1, None, None).expect("mark");
        store.mark_in_progress(Issue, 2, None, None).expect("mark");
        std::thread::sleep(std::time::Duration::from_millis(5));

        let live = HashSet::from([ItemKey::issue(1)]);
        assert_eq!(store.cleanup_stale_items(0, &live).expect("cleanup"), 1);
        assert!(store.is_in_progress(Issue, 1).expect("query"));
        assert!(store.get_item(Issue, 2).expect("get").is_none());
    }

    #[test]
    fn clear_item_and_clear_all() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_in_progress(Issue, 1, None, None).expect("mark");
        store.mark_in_progress(PrReview, 2, None, None).expect("mark");

        assert!(store.clear_item(Issue, 1).expect("clear"));
        assert!(!store.clear_item(Issue, 1).expect("clear again"));
        assert_eq!(store.clear_all().expect("clear all"), 1);
        assert!(store.items().expect("items").is_empty());
    }

    /// Ensures the persisted layout matches the documented state file format.
    #[test]
    fn persisted_layout_uses_kind_number_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.mark_in_progress(PrReview, 12, None, None).expect("mark");
        let raw = fs::read_to_string(store.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let item = &value["work_items"]["pr_review:12"];
        assert_eq!(item["item_type"], "pr_review");
        assert_eq!(item["status"], "in_progress");
        assert!(value["last_updated"].is_string());
        assert!(!temp.path().join("state.json.tmp").exists());
    }
}
