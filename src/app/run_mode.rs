//! `agentrelay run`: one user message, streamed, with interactive approvals.

use std::future::Future;
use std::sync::Arc;

use agentrelay::error::OrchestratorError;
use agentrelay::ids::ConversationId;
use agentrelay::orchestrator::{Orchestrator, TurnOutcome};
use agentrelay::session::UserDecision;
use tracing::info;

use crate::app::approval::read_approval_decision;
use crate::app::observer::TerminalObserver;
use crate::app::render::Renderer;

pub(crate) struct RunOptions {
    pub prompt: String,
    pub new_thread: bool,
    pub followup: bool,
    pub approval_policy: Option<String>,
    pub machine: Option<String>,
}

/// Run one message to completion and return the process exit code.
pub(crate) async fn run_message(
    relay: Arc<Orchestrator>,
    conversation: &ConversationId,
    options: RunOptions,
    renderer: Renderer,
    color: bool,
) -> Result<i32, OrchestratorError> {
    if let Some(policy) = &options.approval_policy {
        relay.set_approval_policy(conversation, policy)?;
    }
    let state = relay.status(conversation)?.state;
    if let Some(machine) = options.machine.as_deref().filter(|m| *m != state.machine) {
        relay.switch_machine(conversation, machine)?;
        renderer.activity(&format!("switched to machine '{machine}'; starting a new thread"));
    }
    if options.new_thread {
        relay.new_thread(conversation)?;
    }

    let machine = relay.status(conversation)?.state.machine;
    let observer = Arc::new(TerminalObserver::new(renderer, color, &machine));
    let mut outcome = if options.followup {
        with_interrupt(&relay, conversation, relay.send_followup(conversation, &options.prompt, observer.clone())).await?
    } else {
        with_interrupt(&relay, conversation, relay.start_turn(conversation, &options.prompt, observer.clone())).await?
    };

    while let TurnOutcome::AwaitingApproval { run_id, .. } = &outcome {
        let decision = tokio::select! {
            decision = read_approval_decision(observer.offer_similar()) => decision,
            _ = tokio::signal::ctrl_c() => UserDecision::Cancel,
        };
        info!(conversation = %conversation, %run_id, %decision, "user decision");
        if decision == UserDecision::Cancel {
            relay.cancel_turn(conversation).await?;
            outcome = TurnOutcome::Cancelled;
            break;
        }
        observer.set_machine(&relay.status(conversation)?.state.machine);
        let run_id = run_id.clone();
        outcome = with_interrupt(
            &relay,
            conversation,
            relay.respond_approval(conversation, &run_id, decision, observer.clone()),
        )
        .await?;
    }

    observer.finish_line();
    Ok(report_outcome(&renderer, &outcome))
}

/// Await `turn`; on Ctrl-C cancel the run and let the turn wind down.
async fn with_interrupt<F>(
    relay: &Orchestrator,
    conversation: &ConversationId,
    turn: F,
) -> Result<TurnOutcome, OrchestratorError>
where
    F: Future<Output = Result<TurnOutcome, OrchestratorError>>,
{
    tokio::pin!(turn);
    tokio::select! {
        outcome = &mut turn => outcome,
        _ = tokio::signal::ctrl_c() => {
            relay.cancel_turn(conversation).await?;
            turn.await
        }
    }
}

/// Exit code for a finished turn.
pub(crate) fn report_outcome(renderer: &Renderer, outcome: &TurnOutcome) -> i32 {
    match outcome {
        TurnOutcome::Completed | TurnOutcome::NoResponse => 0,
        TurnOutcome::Failed { message } => {
            renderer.error(message);
            1
        }
        TurnOutcome::Cancelled => {
            renderer.warn("cancelled");
            130
        }
        TurnOutcome::AwaitingApproval { .. } => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exit_codes() {
        let renderer = Renderer::new(false);
        assert_eq!(report_outcome(&renderer, &TurnOutcome::Completed), 0);
        assert_eq!(report_outcome(&renderer, &TurnOutcome::NoResponse), 0);
        assert_eq!(
            report_outcome(&renderer, &TurnOutcome::Failed { message: "boom".into() }),
            1
        );
        assert_eq!(report_outcome(&renderer, &TurnOutcome::Cancelled), 130);
    }
}
