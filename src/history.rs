//! Backend session logs (`<sessions_root>/**/<...>-<uuid>.jsonl`).
//!
//! Used to browse resumable threads and to recover token telemetry that
//! was not captured while streaming (for example after a restart).

use std::path::Path;

use tracing::debug;

use crate::error::MachineError;
use crate::events::{parse_event_obj, parse_json_line, AgentEvent, TokenUsageSnapshot};
use crate::machine::Machine;

/// Lines read from the end of a session log before falling back to a full read.
const TAIL_LINES: &str = "2000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: String,
    pub path: String,
    /// Unix seconds; `None` when the machine could not stat the file.
    pub updated_at: Option<i64>,
}

/// The trailing five dash-separated groups of a `.jsonl` file name.
pub fn session_id_from_filename(path: &str) -> Option<String> {
    let name = Path::new(path).file_name()?.to_str()?;
    let stem = name.strip_suffix(".jsonl")?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 5 {
        return None;
    }
    let candidate = parts[parts.len() - 5..].join("-");
    if candidate.split('-').any(str::is_empty) {
        return None;
    }
    Some(candidate)
}

/// Latest token telemetry found in JSONL text.
pub fn extract_latest_token_usage(jsonl: &str) -> Option<TokenUsageSnapshot> {
    jsonl
        .lines()
        .filter_map(|line| parse_json_line(line.trim()).ok())
        .flat_map(|obj| parse_event_obj(&obj))
        .filter_map(|event| match event {
            AgentEvent::TokenUsage { usage } => Some(usage),
            _ => None,
        })
        .last()
}

fn sessions_pattern(root: &str, file_glob: &str) -> String {
    format!("{}/**/{file_glob}", root.trim_end_matches('/'))
}

/// Sessions under `sessions_root`, newest first, at most `limit`.
pub async fn list_sessions(
    machine: &dyn Machine,
    sessions_root: &str,
    limit: usize,
) -> Result<Vec<SessionMeta>, MachineError> {
    let root = machine.realpath(sessions_root).await?;
    let paths = machine.list_glob(&sessions_pattern(&root, "*.jsonl")).await?;
    let mut sessions = Vec::new();
    for path in paths {
        let Some(session_id) = session_id_from_filename(&path) else {
            continue;
        };
        let updated_at = machine.modified_unix(&path).await.ok().filter(|t| *t > 0);
        sessions.push(SessionMeta {
            session_id,
            path,
            updated_at,
        });
    }
    sessions.sort_by(|a, b| b.updated_at.unwrap_or(0).cmp(&a.updated_at.unwrap_or(0)));
    sessions.truncate(limit);
    Ok(sessions)
}

/// Path of the log for `thread_id`, if one exists.
pub async fn find_session_path(
    machine: &dyn Machine,
    sessions_root: &str,
    thread_id: &str,
) -> Result<Option<String>, MachineError> {
    let root = machine.realpath(sessions_root).await?;
    let paths = machine
        .list_glob(&sessions_pattern(&root, &format!("*{thread_id}.jsonl")))
        .await?;
    Ok(paths.into_iter().next())
}

/// Latest token telemetry recorded for `thread_id`.
pub async fn read_latest_token_usage(
    machine: &dyn Machine,
    sessions_root: &str,
    thread_id: &str,
) -> Result<Option<TokenUsageSnapshot>, MachineError> {
    let Some(path) = find_session_path(machine, sessions_root, thread_id).await? else {
        return Ok(None);
    };
    // Session logs grow large; try the tail first.
    let argv = ["tail", "-n", TAIL_LINES, path.as_str()].map(str::to_string);
    match machine.exec_capture(&argv, None).await {
        Ok(result) if result.exit_code == 0 && !result.stdout.trim().is_empty() => {
            if let Some(usage) = extract_latest_token_usage(&result.stdout) {
                return Ok(Some(usage));
            }
        }
        Ok(result) => debug!(code = result.exit_code, %path, "tail produced nothing usable"),
        Err(err) => debug!(error = %err, %path, "tail failed"),
    }
    let text = machine.read_text(&path).await?;
    Ok(extract_latest_token_usage(&text))
}
