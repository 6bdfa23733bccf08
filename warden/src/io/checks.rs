//! Runs check commands (linters, test suites) inside an isolation.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::core::checks::{CheckResult, CheckStatus, summarize};
use crate::io::process::run_command_with_timeout;

const CHECK_OUTPUT_LIMIT_BYTES: usize = 200_000;

/// Run each command through `sh -c`, sequentially, continuing past failures.
///
/// Returns `(all_passed, report)`; the report has one block per command.
#[instrument(skip_all, fields(cwd = %cwd.display(), count = commands.len()))]
pub async fn run_checks(commands: &[String], cwd: &Path, timeout: Duration) -> (bool, String) {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let status = run_one(command, cwd, timeout).await;
        match &status {
            CheckStatus::Passed => info!(command = %command, "check passed"),
            other => warn!(command = %command, status = ?other, "check did not pass"),
        }
        results.push(CheckResult {
            command: command.clone(),
            status,
        });
    }
    summarize(&results)
}

async fn run_one(command: &str, cwd: &Path, timeout: Duration) -> CheckStatus {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    match run_command_with_timeout(cmd, None, timeout, CHECK_OUTPUT_LIMIT_BYTES).await {
        Ok(out) if out.timed_out => CheckStatus::TimedOut {
            timeout_secs: timeout.as_secs(),
        },
        Ok(out) if out.status.success() => CheckStatus::Passed,
        Ok(out) => CheckStatus::Failed {
            exit_code: out.exit_code(),
            output: out.combined(),
        },
        Err(err) => CheckStatus::Error(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One passing and one failing command: overall false, both reported.
    #[tokio::test]
    async fn mixed_checks_report_pass_and_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = vec!["true".to_string(), "echo broken; exit 4".to_string()];
        let (passed, report) = run_checks(&commands, temp.path(), Duration::from_secs(10)).await;
        assert!(!passed);
        assert!(report.contains("✅ `true` - Passed"));
        assert!(report.contains("❌ `echo broken; exit 4` - Failed (exit code 4)"));
        assert!(report.contains("broken"));
    }

    #[tokio::test]
    async fn hung_check_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = vec!["sleep 30".to_string()];
        let (passed, report) =
            run_checks(&commands, temp.path(), Duration::from_millis(300)).await;
        assert!(!passed);
        assert!(report.contains("Timed out"));
    }

    #[tokio::test]
    async fn checks_run_in_the_given_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker"), "x").expect("write");
        let (passed, _) = run_checks(
            &["test -f marker".to_string()],
            temp.path(),
            Duration::from_secs(10),
        )
        .await;
        assert!(passed);
    }
}
