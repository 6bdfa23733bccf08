//! `warden clear`: forget records so items are picked up again.

use anyhow::Result;
use tracing::info;

use crate::core::types::ItemKey;
use crate::io::store::WorkItemStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    One(ItemKey),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Removed(usize),
    NotFound,
    Cancelled,
}

/// Clear one record or all of them. `confirm` is asked (with the record
/// count) before clearing everything; it is not consulted for single items.
pub fn clear_items(
    store: &WorkItemStore,
    target: ClearTarget,
    confirm: impl FnOnce(usize) -> Result<bool>,
) -> Result<ClearOutcome> {
    match target {
        ClearTarget::One(key) => {
            if store.clear_item(key.kind, key.number)? {
                info!(key = %key, "cleared work item");
                Ok(ClearOutcome::Removed(1))
            } else {
                Ok(ClearOutcome::NotFound)
            }
        }
        ClearTarget::All => {
            let count = store.items()?.len();
            if count == 0 {
                return Ok(ClearOutcome::Removed(0));
            }
            if !confirm(count)? {
                return Ok(ClearOutcome::Cancelled);
            }
            let removed = store.clear_all()?;
            info!(count = removed, "cleared all work items");
            Ok(ClearOutcome::Removed(removed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkItemKind;

    fn store_with_two() -> (tempfile::TempDir, WorkItemStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = WorkItemStore::open(temp.path().join("state.json"));
        store
            .mark_in_progress(WorkItemKind::Issue, 1, None, None)
            .expect("mark");
        store
            .mark_in_progress(WorkItemKind::PrReview, 2, None, None)
            .expect("mark");
        store.mark_failed(WorkItemKind::PrReview, 2, "boom").expect("fail");
        (temp, store)
    }

    #[test]
    fn clearing_one_item_leaves_others() {
        let (_temp, store) = store_with_two();
        let outcome = clear_items(&store, ClearTarget::One(ItemKey::review(2)), |_| {
            panic!("single clear must not ask for confirmation")
        })
        .expect("clear");
        assert_eq!(outcome, ClearOutcome::Removed(1));
        assert!(store.get_item(WorkItemKind::PrReview, 2).expect("get").is_none());
        assert!(store.get_item(WorkItemKind::Issue, 1).expect("get").is_some());
    }

    #[test]
    fn clearing_unknown_item_reports_not_found() {
        let (_temp, store) = store_with_two();
        let outcome =
            clear_items(&store, ClearTarget::One(ItemKey::issue(99)), |_| Ok(true)).expect("clear");
        assert_eq!(outcome, ClearOutcome::NotFound);
    }

    #[test]
    fn declined_confirmation_keeps_everything() {
        let (_temp, store) = store_with_two();
        let outcome = clear_items(&store, ClearTarget::All, |count| {
            assert_eq!(count, 2);
            Ok(false)
        })
        .expect("clear");
        assert_eq!(outcome, ClearOutcome::Cancelled);
        assert_eq!(store.items().expect("items").len(), 2);
    }

    #[test]
    fn confirmed_clear_all_empties_the_store() {
        let (_temp, store) = store_with_two();
        let outcome = clear_items(&store, ClearTarget::All, |_| Ok(true)).expect("clear");
        assert_eq!(outcome, ClearOutcome::Removed(2));
        assert!(store.items().expect("items").is_empty());
    }
}
