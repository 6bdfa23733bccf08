//! Check-command results and their markdown report.

use crate::core::text::truncate_chars;

/// Output kept per failed check in the report.
pub const CHECK_OUTPUT_MAX_CHARS: usize = 1000;

/// How one check command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    Failed { exit_code: Option<i32>, output: String },
    TimedOut { timeout_secs: u64 },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub command: String,
    pub status: CheckStatus,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }

    /// One report block for this command.
    pub fn render(&self) -> String {
        let cmd = &self.command;
        match &self.status {
            CheckStatus::Passed => format!("✅ `{cmd}` - Passed"),
            CheckStatus::Failed { exit_code, output } => {
                let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let output = truncate_chars(output.trim(), CHECK_OUTPUT_MAX_CHARS);
                format!("❌ `{cmd}` - Failed (exit code {code})\n```\n{output}\n```")
            }
            CheckStatus::TimedOut { timeout_secs } => {
                format!("❌ `{cmd}` - Timed out after {timeout_secs}s")
            }
            CheckStatus::Error(message) => format!("❌ `{cmd}` - Error: {message}"),
        }
    }
}

/// Overall pass flag plus the joined report.
pub fn summarize(results: &[CheckResult]) -> (bool, String) {
    let all_passed = results.iter().all(CheckResult::passed);
    let report = results
        .iter()
        .map(CheckResult::render)
        .collect::<Vec<_>>()
        .join("\n\n");
    (all_passed, report)
}
