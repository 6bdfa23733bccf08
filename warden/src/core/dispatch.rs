//! Pure dispatch planning: slot accounting, dedup filtering, review eligibility.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ItemKey;

/// Number of new workflows that may start given the busy count.
pub fn available_slots(max_concurrent: usize, busy: usize) -> usize {
    max_concurrent.saturating_sub(busy)
}

/// Pick candidates in order, skipping busy keys, until `slots` are used.
///
/// Keys accepted earlier in the same call count as busy, so duplicates in the
/// candidate list are launched at most once.
pub fn select_candidates<T>(
    candidates: Vec<T>,
    key_of: impl Fn(&T) -> ItemKey,
    mut is_busy: impl FnMut(ItemKey) -> bool,
    slots: usize,
) -> Vec<T> {
    let mut picked: Vec<T> = Vec::new();
    let mut picked_keys: Vec<ItemKey> = Vec::new();
    for candidate in candidates {
        if picked.len() >= slots {
            break;
        }
        let key = key_of(&candidate);
        if picked_keys.contains(&key) || is_busy(key) {
            continue;
        }
        picked_keys.push(key);
        picked.push(candidate);
    }
    picked
}

/// Which open pull requests get an automated review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewPolicy {
    /// Label that requests a review. Canonical eligibility rule.
    pub trigger_label: String,
    /// Authors whose PRs are reviewed even without the label.
    pub review_authors: Vec<String>,
}

impl ReviewPolicy {
    pub fn is_eligible(&self, labels: &[String], author: &str, draft: bool) -> bool {
        if draft {
            return false;
        }
        labels.iter().any(|label| label == &self.trigger_label)
            || self
                .review_authors
                .iter()
                .any(|a| a.eq_ignore_ascii_case(author))
    }
}

static LINKED_ISSUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s+#(\d+)")
        .expect("linked issue pattern should be valid")
});

/// Issue numbers a PR body claims to close (`Closes #12`, `fixes #3`, ...).
pub fn linked_issues(body: &str) -> Vec<u64> {
    let mut numbers: Vec<u64> = LINKED_ISSUE_RE
        .captures_iter(body)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_never_underflow() {
        assert_eq!(available_slots(2, 0), 2);
        assert_eq!(available_slots(2, 2), 0);
        assert_eq!(available_slots(2, 5), 0);
    }

    /// With 5 candidates and 2 slots only the first two non-busy ones are picked.
    #[test]
    fn selection_stops_at_slot_count_and_skips_busy() {
        let picked = select_candidates(
            vec![1_u64, 2, 3, 4, 5],
            |n| ItemKey::issue(*n),
            |key| key.number == 2,
            2,
        );
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn duplicate_candidates_are_picked_once() {
        let picked = select_candidates(vec![7_u64, 7, 8], |n| ItemKey::issue(*n), |_| false, 3);
        assert_eq!(picked, vec![7, 8]);
    }

    #[test]
    fn review_policy_honors_label_authors_and_drafts() {
        let policy = ReviewPolicy {
            trigger_label: "warden".to_string(),
            review_authors: vec!["Dependabot".to_string()],
        };
        let labeled = vec!["warden".to_string()];
        assert!(policy.is_eligible(&labeled, "alice", false));
        assert!(!policy.is_eligible(&labeled, "alice", true));
        assert!(policy.is_eligible(&[], "dependabot", false));
        assert!(!policy.is_eligible(&[], "alice", false));
    }

    #[test]
    fn linked_issues_are_extracted_case_insensitively() {
        let body = "Closes #12\nalso fixes #3 and Resolves #12; mentions #99";
        assert_eq!(linked_issues(body), vec![3, 12]);
    }
}
