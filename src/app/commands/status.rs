//! `agentrelay status` and `agentrelay cancel`.

use agentrelay::error::OrchestratorError;
use agentrelay::ids::ConversationId;
use agentrelay::orchestrator::{ConversationStatus, Orchestrator};
use agentrelay::store::ActiveRun;

use crate::app::render::Renderer;

pub(crate) fn handle_status_command(
    renderer: &Renderer,
    relay: &Orchestrator,
    conversation: &ConversationId,
) -> Result<(), OrchestratorError> {
    let status = relay.status(conversation)?;
    renderer.section(&format!("conversation {conversation}"));
    for (key, value) in status_fields(&status) {
        renderer.field(key, &value);
    }
    Ok(())
}

fn status_fields(status: &ConversationStatus) -> Vec<(&'static str, String)> {
    let state = &status.state;
    let mut fields = vec![
        ("machine", state.machine.clone()),
        ("workdir", state.workdir.clone()),
        (
            "thread",
            state
                .thread_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "(none)".to_string()),
        ),
        ("approval policy", state.approval_policy.clone()),
    ];
    if let Some(title) = &state.thread_title {
        fields.push(("title", title.clone()));
    }
    if let Some(model) = &state.model {
        fields.push(("model", model.clone()));
    }
    if let (Some(remaining), Some(window)) = (state.last_context_remaining, state.last_context_window) {
        fields.push(("context left", format!("{remaining} of {window} tokens")));
    }
    for (label, window) in [("rate limit (primary)", &state.rate_primary), ("rate limit (secondary)", &state.rate_secondary)] {
        if let Some(used) = window.as_ref().and_then(|w| w.used_percent) {
            fields.push((label, format!("{used:.0}% used")));
        }
    }
    fields.push(("active run", active_run_label(status.active_run.as_ref())));
    fields
}

fn active_run_label(active: Option<&ActiveRun>) -> String {
    match active {
        None => "(none)".to_string(),
        Some(active) => match &active.pending {
            Some(pending) => format!(
                "{} {} [{}]",
                active.run_id,
                active.status.as_str(),
                pending.command()
            ),
            None => format!("{} {}", active.run_id, active.status.as_str()),
        },
    }
}

/// Returns whether anything was cancelled.
pub(crate) async fn handle_cancel_command(
    renderer: &Renderer,
    relay: &Orchestrator,
    conversation: &ConversationId,
) -> Result<bool, OrchestratorError> {
    let cancelled = relay.cancel_turn(conversation).await?;
    if cancelled {
        renderer.activity("cancelled; pending approval cleared");
    } else {
        renderer.activity("nothing to cancel");
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay::ids::RunId;
    use agentrelay::store::{PendingAction, RunStatus};

    #[test]
    fn active_run_label_shows_pending_command() {
        assert_eq!(active_run_label(None), "(none)");
        let active = ActiveRun {
            run_id: RunId::new("r1"),
            status: RunStatus::WaitingApproval,
            pending: Some(PendingAction::ProxyExec {
                command: "touch a".into(),
                cwd: "/w".into(),
                reason: None,
            }),
            updated_at: 0,
        };
        assert_eq!(active_run_label(Some(&active)), "r1 waiting_approval [touch a]");
    }
}
