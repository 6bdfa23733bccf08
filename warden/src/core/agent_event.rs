//! Decoding of the agent's line-delimited JSON event stream.
//!
//! The agent prints one JSON object per line (`--output-format stream-json`).
//! Decoding is defensive: malformed lines yield no events, unknown event types
//! yield [`AgentEvent::Unrecognized`], and nothing here ever fails.

use serde_json::Value;

use crate::core::text::one_line;

/// One decoded event from the agent stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    SessionInit {
        session_id: Option<String>,
        model: Option<String>,
    },
    Text(String),
    ToolStart {
        name: String,
        detail: Option<String>,
    },
    ToolStop {
        is_error: bool,
    },
    /// Terminal event. Authoritative for summary, error flag, cost, and session.
    Result {
        text: Option<String>,
        is_error: bool,
        cost_usd: Option<f64>,
        session_id: Option<String>,
        num_turns: Option<u64>,
    },
    Unrecognized(String),
}

/// How a progress note changes the "current tool" shown for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolUpdate {
    Keep,
    Set(String),
    Clear,
}

/// Human-readable progress derived from one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressNote {
    pub line: String,
    pub tool: ToolUpdate,
}

const NOTE_MAX_CHARS: usize = 160;

/// Decode one stdout line into zero or more events.
pub fn parse_event_line(line: &str) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Vec::new();
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };

    match kind {
        "system" => {
            if value.get("subtype").and_then(Value::as_str) == Some("init") {
                vec![AgentEvent::SessionInit {
                    session_id: str_field(&value, "session_id"),
                    model: str_field(&value, "model"),
                }]
            } else {
                vec![AgentEvent::Unrecognized("system".to_string())]
            }
        }
        "assistant" => content_blocks(&value)
            .iter()
            .filter_map(assistant_block)
            .collect(),
        "user" => content_blocks(&value)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| AgentEvent::ToolStop {
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect(),
        "result" => {
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| {
                    value
                        .get("subtype")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s != "success")
                });
            vec![AgentEvent::Result {
                text: str_field(&value, "result"),
                is_error,
                cost_usd: value
                    .get("total_cost_usd")
                    .or_else(|| value.get("cost_usd"))
                    .and_then(Value::as_f64),
                session_id: str_field(&value, "session_id"),
                num_turns: value.get("num_turns").and_then(Value::as_u64),
            }]
        }
        other => vec![AgentEvent::Unrecognized(other.to_string())],
    }
}

/// Short progress line for an event, or `None` for events not worth showing.
pub fn describe(event: &AgentEvent) -> Option<ProgressNote> {
    match event {
        AgentEvent::SessionInit { model, .. } => Some(ProgressNote {
            line: match model {
                Some(model) => format!("session started ({model})"),
                None => "session started".to_string(),
            },
            tool: ToolUpdate::Keep,
        }),
        AgentEvent::Text(text) => {
            let line = one_line(text, NOTE_MAX_CHARS);
            (!line.is_empty()).then_some(ProgressNote {
                line,
                tool: ToolUpdate::Keep,
            })
        }
        AgentEvent::ToolStart { name, detail } => Some(ProgressNote {
            line: match detail {
                Some(detail) => format!("→ {name}: {}", one_line(detail, NOTE_MAX_CHARS)),
                None => format!("→ {name}"),
            },
            tool: ToolUpdate::Set(name.clone()),
        }),
        AgentEvent::ToolStop { is_error } => is_error.then(|| ProgressNote {
            line: "tool call failed".to_string(),
            tool: ToolUpdate::Clear,
        }),
        AgentEvent::Result { is_error, num_turns, .. } => Some(ProgressNote {
            line: match (is_error, num_turns) {
                (true, _) => "finished with error".to_string(),
                (false, Some(turns)) => format!("finished after {turns} turns"),
                (false, None) => "finished".to_string(),
            },
            tool: ToolUpdate::Clear,
        }),
        AgentEvent::Unrecognized(_) => None,
    }
}

fn content_blocks(value: &Value) -> Vec<Value> {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn assistant_block(block: &Value) -> Option<AgentEvent> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = block.get("text").and_then(Value::as_str)?.trim();
            (!text.is_empty()).then(|| AgentEvent::Text(text.to_string()))
        }
        "tool_use" => Some(AgentEvent::ToolStart {
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string(),
            detail: block.get("input").and_then(tool_detail),
        }),
        _ => None,
    }
}

/// Pick the most telling argument of a tool call for display.
fn tool_detail(input: &Value) -> Option<String> {
    ["command", "file_path", "pattern", "path", "description"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_and_blank_lines_yield_nothing() {
        assert!(parse_event_line("").is_empty());
        assert!(parse_event_line("not json").is_empty());
        assert!(parse_event_line("{\"no_type\":1}").is_empty());
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        assert_eq!(
            parse_event_line(r#"{"type":"stream_event"}"#),
            vec![AgentEvent::Unrecognized("stream_event".to_string())]
        );
    }

    #[test]
    fn init_event_carries_session_and_model() {
        let events = parse_event_line(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus"}"#,
        );
        assert_eq!(
            events,
            vec![AgentEvent::SessionInit {
                session_id: Some("abc".to_string()),
                model: Some("opus".to_string()),
            }]
        );
    }

    /// An assistant message with several blocks yields one event per meaningful block.
    #[test]
    fn assistant_message_splits_into_text_and_tool_events() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Looking around"},
            {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"cargo test"}},
            {"type":"thinking","thinking":"..."}
        ]}}"#
            .replace('\n', "");
        let events = parse_event_line(&line);
        assert_eq!(
            events,
            vec![
                AgentEvent::Text("Looking around".to_string()),
                AgentEvent::ToolStart {
                    name: "Bash".to_string(),
                    detail: Some("cargo test".to_string()),
                },
            ]
        );
    }

    #[test]
    fn tool_result_becomes_tool_stop() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":true}]}}"#;
        assert_eq!(
            parse_event_line(line),
            vec![AgentEvent::ToolStop { is_error: true }]
        );
    }

    #[test]
    fn result_event_is_decoded() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"All done","total_cost_usd":0.25,"session_id":"s1","num_turns":4}"#;
        assert_eq!(
            parse_event_line(line),
            vec![AgentEvent::Result {
                text: Some("All done".to_string()),
                is_error: false,
                cost_usd: Some(0.25),
                session_id: Some("s1".to_string()),
                num_turns: Some(4),
            }]
        );
    }

    #[test]
    fn result_without_error_flag_falls_back_to_subtype() {
        let line = r#"{"type":"result","subtype":"error_max_turns"}"#;
        match parse_event_line(line).as_slice() {
            [AgentEvent::Result { is_error, text, .. }] => {
                assert!(*is_error);
                assert!(text.is_none());
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn tool_start_sets_current_tool() {
        let note = describe(&AgentEvent::ToolStart {
            name: "Read".to_string(),
            detail: Some("src/lib.rs".to_string()),
        })
        .expect("note");
        assert_eq!(note.line, "→ Read: src/lib.rs");
        assert_eq!(note.tool, ToolUpdate::Set("Read".to_string()));
    }

    #[test]
    fn successful_tool_stop_is_silent() {
        assert!(describe(&AgentEvent::ToolStop { is_error: false }).is_none());
        assert!(describe(&AgentEvent::Unrecognized("x".to_string())).is_none());
    }
}
