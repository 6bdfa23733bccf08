//! Agent abstraction for coding-agent invocation.
//!
//! The [`AgentInvoker`] trait decouples workflows from the actual agent backend
//! (the `claude` CLI). Tests use scripted invokers that return predetermined
//! outcomes without spawning processes.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::core::activity::ProgressEvent;
use crate::core::agent_event::{describe, parse_event_line};
use crate::core::outcome::{Outcome, RunTranscript, classify};
use crate::core::types::ItemKey;
use crate::io::checks;
use crate::io::config::AgentConfig;
use crate::io::process::run_command_streaming;
use crate::io::progress::ProgressSink;

const AGENT_OUTPUT_LIMIT_BYTES: usize = 10_000_000;

/// The agent could not be started at all. Aborts the workflow.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent executable '{command}' not found; is it installed and on PATH?")]
    Unavailable { command: String },
    #[error("failed to launch agent '{command}': {message}")]
    Launch { command: String, message: String },
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Work item the run belongs to (used to tag progress).
    pub key: ItemKey,
    pub prompt: String,
    /// Isolation directory the agent works in.
    pub workdir: PathBuf,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    pub progress: Option<ProgressSink>,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run the agent. Timeouts and agent-reported failures are failed outcomes,
    /// not errors; only launch failures ([`AgentError`]) are errors.
    async fn invoke(&self, request: AgentRequest) -> Result<Outcome>;

    /// Run check commands in `cwd`, continuing past failures.
    async fn run_checks(&self, commands: &[String], cwd: &Path, timeout: Duration) -> (bool, String) {
        checks::run_checks(commands, cwd, timeout).await
    }
}

/// Invoker that spawns the `claude` CLI in print mode with streamed JSON events.
#[derive(Debug, Clone)]
pub struct ClaudeInvoker {
    config: AgentConfig,
}

impl ClaudeInvoker {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string())
            .arg("--permission-mode")
            .arg("acceptEdits");
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        cmd.args(&self.config.extra_args)
            .arg(&request.prompt)
            .current_dir(&request.workdir);
        cmd
    }
}

#[async_trait]
impl AgentInvoker for ClaudeInvoker {
    #[instrument(skip_all, fields(key = %request.key, timeout_secs = request.timeout.as_secs()))]
    async fn invoke(&self, request: AgentRequest) -> Result<Outcome> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let started = Instant::now();
        let cmd = self.command(&request);

        let key = request.key;
        let sink = request.progress.clone();
        let mut events = Vec::new();
        let result = run_command_streaming(cmd, request.timeout, AGENT_OUTPUT_LIMIT_BYTES, |line| {
            for event in parse_event_line(line) {
                if let (Some(sink), Some(note)) = (&sink, describe(&event)) {
                    sink.send(ProgressEvent::Note { key, note });
                }
                events.push(event);
            }
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let command = self.config.command.clone();
                let not_found = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                warn!(command = %command, err = %format!("{err:#}"), "agent launch failed");
                if not_found {
                    return Err(AgentError::Unavailable { command }.into());
                }
                return Err(AgentError::Launch {
                    command,
                    message: format!("{err:#}"),
                }
                .into());
            }
        };

        let elapsed = started.elapsed();
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Ok(Outcome::timed_out(request.timeout, elapsed));
        }

        let transcript = RunTranscript {
            events,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.exit_code(),
        };
        let outcome = classify(&transcript, elapsed);
        debug!(
            succeeded = outcome.succeeded,
            exit_code = ?outcome.exit_code,
            cost_usd = ?outcome.cost_usd,
            "agent finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::core::text::NO_RESULT_PLACEHOLDER;

    /// Write an executable shell script standing in for the agent CLI.
    fn fake_agent(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.display().to_string()
    }

    fn request(dir: &Path, timeout: Duration, progress: Option<ProgressSink>) -> AgentRequest {
        AgentRequest {
            key: ItemKey::issue(1),
            prompt: "do it".to_string(),
            workdir: dir.to_path_buf(),
            allowed_tools: vec!["Read".to_string(), "Bash".to_string()],
            timeout,
            progress,
        }
    }

    fn invoker(command: String) -> ClaudeInvoker {
        ClaudeInvoker::new(AgentConfig {
            command,
            ..AgentConfig::default()
        })
    }

    #[tokio::test]
    async fn stream_result_event_drives_outcome_and_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = fake_agent(
            temp.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"s-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"Implemented","total_cost_usd":0.1}'"#,
        );
        let (sink, mut rx) = ProgressSink::channel(16);
        let outcome = invoker(script)
            .invoke(request(temp.path(), Duration::from_secs(10), Some(sink)))
            .await
            .expect("invoke");
        assert!(outcome.succeeded);
        assert_eq!(outcome.summary, "Implemented");
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));

        let mut lines = Vec::new();
        while let Ok(ProgressEvent::Note { note, .. }) = rx.try_recv() {
            lines.push(note.line);
        }
        assert!(lines.iter().any(|l| l == "→ Bash: ls"));
    }

    #[tokio::test]
    async fn arguments_include_tools_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = fake_agent(temp.path(), r#"echo "$@" >&2; exit 0"#);
        let outcome = invoker(script)
            .invoke(request(temp.path(), Duration::from_secs(10), None))
            .await
            .expect("invoke");
        // No JSON on stdout: the summary falls back to stderr.
        assert!(outcome.summary.contains("--allowedTools Read,Bash"));
        assert!(outcome.summary.contains("--output-format stream-json"));
        assert!(outcome.summary.ends_with("do it"));
    }

    /// A hung agent is killed and reported as a failed, timed-out outcome.
    #[tokio::test]
    async fn timeout_yields_failed_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = fake_agent(temp.path(), "exec sleep 30");
        let outcome = invoker(script)
            .invoke(request(temp.path(), Duration::from_millis(300), None))
            .await
            .expect("invoke");
        assert!(!outcome.succeeded);
        assert!(outcome.timed_out);
        assert!(outcome.summary.contains("timed out"));
    }

    #[tokio::test]
    async fn silent_failure_uses_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = fake_agent(temp.path(), "exit 1");
        let outcome = invoker(script)
            .invoke(request(temp.path(), Duration::from_secs(10), None))
            .await
            .expect("invoke");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.summary, NO_RESULT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = invoker("no-such-agent-binary-xyz".to_string())
            .invoke(request(temp.path(), Duration::from_secs(1), None))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::Unavailable { .. })
        ));
    }
}
