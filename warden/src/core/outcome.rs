//! Classified result of one agent invocation.

use std::time::Duration;

use crate::core::agent_event::AgentEvent;
use crate::core::text::{is_blank_output, non_empty_or_placeholder};

/// What an agent run produced. A failed run is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub succeeded: bool,
    /// Human-readable summary. Never empty and never "No output".
    pub summary: String,
    pub exit_code: Option<i32>,
    pub cost_usd: Option<f64>,
    pub session_id: Option<String>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl Outcome {
    pub fn success(summary: impl AsRef<str>) -> Self {
        Self {
            succeeded: true,
            summary: non_empty_or_placeholder(summary.as_ref()),
            exit_code: Some(0),
            cost_usd: None,
            session_id: None,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn failure(summary: impl AsRef<str>) -> Self {
        Self {
            succeeded: false,
            exit_code: Some(1),
            ..Self::success(summary)
        }
    }

    pub fn timed_out(timeout: Duration, elapsed: Duration) -> Self {
        Self {
            succeeded: false,
            summary: format!("Agent process timed out after {}s", timeout.as_secs()),
            exit_code: None,
            cost_usd: None,
            session_id: None,
            duration: elapsed,
            timed_out: true,
        }
    }
}

/// Raw material collected while the agent process ran.
#[derive(Debug, Default)]
pub struct RunTranscript {
    pub events: Vec<AgentEvent>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Classify a finished (not timed out) run.
///
/// The terminal result event wins when present. Otherwise the exit code decides
/// and the summary falls back to stdout, then stderr.
pub fn classify(transcript: &RunTranscript, duration: Duration) -> Outcome {
    let exited_ok = transcript.exit_code == Some(0);
    let terminal = transcript.events.iter().rev().find_map(|event| match event {
        AgentEvent::Result {
            text,
            is_error,
            cost_usd,
            session_id,
            ..
        } => Some((text, *is_error, *cost_usd, session_id)),
        _ => None,
    });
    let init_session = transcript.events.iter().find_map(|event| match event {
        AgentEvent::SessionInit { session_id, .. } => session_id.clone(),
        _ => None,
    });

    let (succeeded, summary, cost_usd, session_id) = match terminal {
        Some((text, is_error, cost_usd, session_id)) => {
            let text = text.as_deref().unwrap_or_default();
            let summary = if is_blank_output(text) {
                fallback_text(transcript)
            } else {
                text.to_string()
            };
            (
                exited_ok && !is_error,
                summary,
                cost_usd,
                session_id.clone().or(init_session),
            )
        }
        None => (exited_ok, fallback_text(transcript), None, init_session),
    };

    Outcome {
        succeeded,
        summary: non_empty_or_placeholder(&summary),
        exit_code: transcript.exit_code,
        cost_usd,
        session_id,
        duration,
        timed_out: false,
    }
}

fn fallback_text(transcript: &RunTranscript) -> String {
    let last_text = transcript.events.iter().rev().find_map(|event| match event {
        AgentEvent::Text(text) => Some(text.as_str()),
        _ => None,
    });
    if let Some(text) = last_text.filter(|t| !is_blank_output(t)) {
        return text.to_string();
    }
    if !is_blank_output(&transcript.stdout) && transcript.events.is_empty() {
        return transcript.stdout.clone();
    }
    transcript.stderr.clone()
}
