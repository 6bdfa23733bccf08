//! Markdown bodies posted to issues and pull requests.

use crate::core::text::{non_empty_or_placeholder, truncate_chars};

pub const SIGNATURE: &str = "*Posted by warden*";
/// Header of every automated review. Also used to find the previous review.
pub const REVIEW_HEADER: &str = "## 🤖 Automated Code Review";
pub const CHECKS_HEADER: &str = "## 🔧 Review Checks";

const SHORT_CHARS: usize = 500;
const SUMMARY_CHARS: usize = 1000;
const PR_BODY_CHARS: usize = 2000;
const REVIEW_CHARS: usize = 60_000;

fn signed(body: &str) -> String {
    format!("{body}\n\n{SIGNATURE}")
}

fn clipped(text: &str, max_chars: usize) -> String {
    let text = non_empty_or_placeholder(text);
    truncate_chars(&text, max_chars).to_string()
}

pub fn issue_started(resume: bool) -> String {
    if resume {
        signed("🔄 Resuming work on this issue...")
    } else {
        signed("🚀 Starting work on this issue...")
    }
}

pub fn issue_no_changes(summary: &str) -> String {
    signed(&format!(
        "I looked at this issue but didn't find any changes to make.\n\nAgent's response:\n\n{}",
        clipped(summary, SUMMARY_CHARS)
    ))
}

pub fn issue_completed(summary: &str, pr_url: &str) -> String {
    signed(&format!(
        "✅ Finished working on this issue.\n\n**Summary:** {}\n\n**Pull Request:** {pr_url}",
        clipped(summary, SHORT_CHARS)
    ))
}

pub fn issue_failed(error: &str) -> String {
    signed(&format!(
        "❌ Failed to implement this issue automatically.\n\nError: {}",
        clipped(error, SHORT_CHARS)
    ))
}

/// Failure message recorded when edits were left uncommitted.
pub fn uncommitted_changes(status: &str) -> String {
    format!(
        "Agent made file changes but didn't commit them. Worktree preserved for inspection. Uncommitted files:\n{}",
        truncate_chars(status.trim(), SHORT_CHARS)
    )
}

pub fn pr_title(issue_number: u64, issue_title: &str) -> String {
    format!("Implement #{issue_number}: {}", issue_title.trim())
}

pub fn pr_body(issue_number: u64, summary: &str) -> String {
    format!(
        "Implements #{issue_number}\n\nCloses #{issue_number}\n\n## Changes\n\n{}\n\n---\n{SIGNATURE}\n",
        clipped(summary, PR_BODY_CHARS)
    )
}

pub fn review_started() -> String {
    signed("🔍 Starting code review...")
}

pub fn review_failed(error: &str) -> String {
    signed(&format!(
        "❌ Automated review failed.\n\nError: {}",
        clipped(error, SHORT_CHARS)
    ))
}

/// Combined review comment: header, optional CI line, optional checks section, review.
pub fn review_comment(review: &str, checks_report: Option<&str>, ci_status: Option<&str>) -> String {
    let mut body = format!("{REVIEW_HEADER}\n\n");
    if let Some(ci) = ci_status {
        body.push_str(&format!("**CI status:** {ci}\n\n"));
    }
    if let Some(report) = checks_report.filter(|r| !r.trim().is_empty()) {
        body.push_str(&format!("{CHECKS_HEADER}\n\n{report}\n\n"));
    }
    body.push_str(&clipped(review, REVIEW_CHARS));
    body.push_str(&format!("\n\n---\n{SIGNATURE}\n"));
    body
}

/// True when `body` is a review posted by this daemon.
pub fn is_automated_review(body: &str) -> bool {
    body.trim_start().starts_with(REVIEW_HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::text::NO_RESULT_PLACEHOLDER;

    #[test]
    fn pr_body_links_issue() {
        let body = pr_body(7, "Added a flag");
        assert!(body.starts_with("Implements #7"));
        assert!(body.contains("Closes #7"));
        assert!(body.contains("Added a flag"));
    }

    #[test]
    fn review_comment_orders_sections() {
        let body = review_comment("Looks good", Some("✅ `lint` - Passed"), Some("success"));
        let header = body.find(REVIEW_HEADER).expect("header");
        let ci = body.find("**CI status:** success").expect("ci");
        let checks = body.find(CHECKS_HEADER).expect("checks");
        let review = body.find("Looks good").expect("review");
        assert!(header < ci && ci < checks && checks < review);
        assert!(is_automated_review(&body));
    }

    #[test]
    fn review_comment_skips_empty_checks_section() {
        let body = review_comment("ok", Some("  "), None);
        assert!(!body.contains(CHECKS_HEADER));
        assert!(!body.contains("CI status"));
    }

    #[test]
    fn empty_summaries_use_placeholder() {
        assert!(issue_no_changes("").contains(NO_RESULT_PLACEHOLDER));
        assert!(review_comment("No output", None, None).contains(NO_RESULT_PLACEHOLDER));
    }
}
