//! In-memory view of what each running agent is doing.
//!
//! Workflows and invokers emit [`ProgressEvent`]s into a bounded channel; one
//! consumer folds them into an [`ActivityBoard`]. Time is passed in by the
//! caller so the board stays deterministic.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::core::agent_event::{ProgressNote, ToolUpdate};
use crate::core::types::ItemKey;

/// Lines retained per agent.
pub const MAX_LINES_PER_AGENT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        key: ItemKey,
        title: String,
        branch: Option<String>,
    },
    Note {
        key: ItemKey,
        note: ProgressNote,
    },
    Finished {
        key: ItemKey,
        succeeded: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AgentActivity {
    pub key: ItemKey,
    pub title: String,
    pub branch: Option<String>,
    pub state: RunState,
    pub current_tool: Option<String>,
    pub lines: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentActivity {
    fn push_line(&mut self, line: String) {
        if self.lines.len() == MAX_LINES_PER_AGENT {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct ActivityBoard {
    agents: BTreeMap<ItemKey, AgentActivity>,
}

impl ActivityBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: ProgressEvent, now: DateTime<Utc>) {
        match event {
            ProgressEvent::Started { key, title, branch } => {
                self.agents.insert(
                    key,
                    AgentActivity {
                        key,
                        title,
                        branch,
                        state: RunState::Running,
                        current_tool: None,
                        lines: VecDeque::new(),
                        started_at: now,
                        finished_at: None,
                    },
                );
            }
            ProgressEvent::Note { key, note } => {
                // Notes for unknown keys (e.g. after pruning) are dropped.
                let Some(agent) = self.agents.get_mut(&key) else {
                    return;
                };
                match note.tool {
                    ToolUpdate::Keep => {}
                    ToolUpdate::Set(tool) => agent.current_tool = Some(tool),
                    ToolUpdate::Clear => agent.current_tool = None,
                }
                agent.push_line(note.line);
            }
            ProgressEvent::Finished { key, succeeded } => {
                if let Some(agent) = self.agents.get_mut(&key) {
                    agent.state = if succeeded {
                        RunState::Completed
                    } else {
                        RunState::Failed
                    };
                    agent.current_tool = None;
                    agent.finished_at = Some(now);
                }
            }
        }
    }

    /// Drop finished agents whose grace period elapsed. Returns how many were removed.
    pub fn prune_finished(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.agents.len();
        self.agents
            .retain(|_, agent| agent.finished_at.is_none_or(|at| now - at < grace));
        before - self.agents.len()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&AgentActivity> {
        self.agents.get(key)
    }

    pub fn running(&self) -> impl Iterator<Item = &AgentActivity> {
        self.agents
            .values()
            .filter(|agent| agent.state == RunState::Running)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
