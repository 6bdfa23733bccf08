//! Helpers for running child processes with timeouts and bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// How long pipe readers may keep draining after the child was killed.
///
/// Grandchildren that inherited the pipes can hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout_lossy();
        let stderr = self.stderr_lossy();
        match (stdout.trim(), stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// `output_limit_bytes` bounds the amount of stdout/stderr kept in memory; bytes
/// beyond it are discarded while still draining the pipe. On timeout the child is
/// killed and `timed_out` is set; that is not an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_inner(cmd, stdin, timeout, output_limit_bytes, |_| {}).await
}

/// Like [`run_command_with_timeout`], but hands each stdout line to `on_line` as it arrives.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_streaming(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    on_line: impl FnMut(&str),
) -> Result<CommandOutput> {
    run_inner(cmd, None, timeout, output_limit_bytes, on_line).await
}

async fn run_inner(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    mut on_line: impl FnMut(&str),
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    debug!(program = %program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(program = %program, err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        tokio::spawn(async move {
            if let Err(e) = child_stdin.write_all(&input).await {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stderr_handle = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    let deadline = tokio::time::Instant::now() + timeout;
    let mut stdout_buf = Vec::new();
    let mut stdout_truncated = 0usize;
    let pump = pump_lines(
        stdout,
        output_limit_bytes,
        &mut stdout_buf,
        &mut stdout_truncated,
        &mut on_line,
    );

    let mut timed_out = tokio::time::timeout_at(deadline, pump).await.is_err();
    let status = if timed_out {
        None
    } else {
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => Some(status.context("wait for command")?),
            Err(_) => {
                timed_out = true;
                None
            }
        }
    };
    let status = match status {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            if let Err(e) = child.start_kill() {
                warn!(err = %e, "kill failed");
            }
            child.wait().await.context("wait command after kill")?
        }
    };

    let (stderr, stderr_truncated) = join_output(stderr_handle, timed_out).await;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout_buf,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
    collected: &mut Vec<u8>,
    truncated: &mut usize,
    on_line: &mut impl FnMut(&str),
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e, "read stdout failed");
                break;
            }
        };
        on_line(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']));

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        *truncated += n - keep;
    }
}

async fn join_output(handle: JoinHandle<(Vec<u8>, usize)>, after_kill: bool) -> (Vec<u8>, usize) {
    if !after_kill {
        return handle.await.unwrap_or_else(|e| {
            warn!(err = %e, "output reader task failed");
            (Vec::new(), 0)
        });
    }
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            warn!(err = %e, "output reader task failed");
            (Vec::new(), 0)
        }
        Err(_) => {
            debug!("output reader still blocked after kill, abandoning it");
            abort.abort();
            (Vec::new(), 0)
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e, "read output failed");
                break;
            }
        };
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    (buf, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .await
        .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert_eq!(out.combined(), "out\nerr");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1000)
            .await
            .expect("run");
        assert_eq!(out.stdout_lossy(), "hello");
    }

    #[tokio::test]
    async fn output_beyond_limit_is_counted_not_kept() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .await
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }

    /// A hung child is killed at the deadline and reported as timed out.
    #[tokio::test]
    async fn timeout_kills_child() {
        let started = std::time::Instant::now();
        let out = run_command_with_timeout(sh("exec sleep 30"), None, Duration::from_millis(300), 1000)
            .await
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn streaming_delivers_each_line() {
        let mut lines = Vec::new();
        let out = run_command_streaming(
            sh("echo one; echo two"),
            Duration::from_secs(10),
            1000,
            |line| lines.push(line.to_string()),
        )
        .await
        .expect("run");
        assert!(out.success());
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary-xyz"),
            None,
            Duration::from_secs(1),
            10,
        )
        .await
        .unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
