//! Text shaping for previews, logs and tool-output reports.
//!
//! All truncation counts characters, never bytes, so a cut can not land
//! inside a multi-byte character.

/// Truncate by characters and append `suffix` when truncation occurs.
pub fn truncate_with_suffix_by_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}{suffix}")
}

/// Cap captured command output before it is fed back to the agent.
pub fn truncate_tool_output(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{}\n...[truncated]...\n", prefix.trim_end())
}

/// Mask tokens that look like API keys.
pub fn redact_secrets(text: &str) -> String {
    text.split(' ')
        .map(|token| {
            let key = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-');
            let looks_like_key = key
                .strip_prefix("sk-")
                .is_some_and(|rest| rest.len() >= 16 && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            if looks_like_key {
                token.replace(key, "<API_KEY>")
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-line, redacted, bounded preview of a command for logs.
pub fn command_preview(command: &str, max_chars: usize) -> String {
    let one_line = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let redacted = redact_secrets(&one_line);
    if redacted.chars().count() <= max_chars {
        return redacted;
    }
    let prefix: String = redacted.chars().take(max_chars).collect();
    format!("{}...", prefix.trim_end())
}

/// Append `line` to `lines`, keeping only the newest `cap` entries.
pub fn push_bounded(lines: &mut Vec<String>, line: String, cap: usize) {
    lines.push(line);
    if lines.len() > cap {
        let excess = lines.len() - cap;
        lines.drain(..excess);
    }
}
