//! `agentrelay sessions`: recent backend session logs on a machine.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agentrelay::config::Config;
use agentrelay::history::{list_sessions, SessionMeta};
use agentrelay::machine::MachineEntry;

use crate::app::commands::format_age;
use crate::app::render::Renderer;

pub(crate) async fn handle_sessions_command(
    renderer: &Renderer,
    config: &Config,
    entry: &MachineEntry,
    current_thread: Option<&str>,
    limit: usize,
) -> Result<(), String> {
    let sessions = list_sessions(entry.machine.as_ref(), &config.backend.sessions_root, limit)
        .await
        .map_err(|err| format!("failed to list sessions on {}: {err}", entry.machine.name()))?;
    render_sessions(renderer, entry.machine.name(), current_thread, &sessions);
    Ok(())
}

fn render_sessions(
    renderer: &Renderer,
    machine: &str,
    current_thread: Option<&str>,
    sessions: &[SessionMeta],
) {
    renderer.section(&format!("sessions on {machine}"));
    if sessions.is_empty() {
        renderer.detail("none");
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    for session in sessions {
        renderer.field(&session_label(session, current_thread), &updated_label(session.updated_at, now));
    }
}

fn session_label(session: &SessionMeta, current_thread: Option<&str>) -> String {
    if current_thread == Some(session.session_id.as_str()) {
        format!("{} (current)", session.session_id)
    } else {
        session.session_id.clone()
    }
}

fn updated_label(updated_at: Option<i64>, now: i64) -> String {
    match updated_at {
        Some(at) => {
            let elapsed = Duration::from_secs(now.saturating_sub(at).max(0) as u64);
            format!("updated {} ago", format_age(elapsed))
        }
        None => "updated at unknown time".to_string(),
    }
}
