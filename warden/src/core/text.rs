//! Character-safe text helpers for comments and logs.

/// Placeholder used whenever the agent produced nothing usable.
pub const NO_RESULT_PLACEHOLDER: &str = "*No result available; inspect the change set.*";

/// Return at most `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// True when `text` carries no information worth surfacing to a human.
pub fn is_blank_output(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("no output")
}

/// Never surface an empty or "No output" body; fall back to the placeholder.
pub fn non_empty_or_placeholder(text: &str) -> String {
    if is_blank_output(text) {
        NO_RESULT_PLACEHOLDER.to_string()
    } else {
        text.trim().to_string()
    }
}

/// Collapse a possibly multi-line text into one short display line.
pub fn one_line(text: &str, max_chars: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let cut = truncate_chars(&joined, max_chars);
    if cut.len() < joined.len() {
        format!("{cut}…")
    } else {
        joined
    }
}
