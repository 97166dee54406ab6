//! Approval prompt rendering and decision helpers.

use crate::app::render::Renderer;
use agentrelay::session::UserDecision;
use agentrelay::store::PendingAction;
use crossterm::style::{Color, Stylize};
use std::io::Write;

/// Render a pending approval and the choices the user has.
pub(crate) fn render_approval_request(
    color: bool,
    renderer: &Renderer,
    machine: &str,
    pending: &PendingAction,
    offer_similar: bool,
) {
    let (label, reason, cwd) = match pending {
        PendingAction::ExecApproval { request, .. } => {
            ("command", request.reason.as_deref(), request.cwd.as_deref())
        }
        PendingAction::ProxyExec { reason, cwd, .. } => {
            ("relay-run command", reason.as_deref(), Some(cwd.as_str()))
        }
    };
    if color {
        eprintln!(
            "{} {} on {}",
            "•".with(Color::DarkGrey),
            format!("approve {label}").with(Color::Yellow).bold(),
            machine.with(Color::White)
        );
    } else {
        eprintln!("• approve {label} on {machine}");
    }
    if let Some(reason) = reason.map(str::trim).filter(|value| !value.is_empty()) {
        renderer.detail(reason);
    }
    if let Some(cwd) = cwd.filter(|value| !value.is_empty()) {
        renderer.field("cwd", cwd);
    }
    renderer.approval_block(pending.command());
    renderer.detail(choices_hint(offer_similar));
}

fn choices_hint(offer_similar: bool) -> &'static str {
    if offer_similar {
        "[y] approve once  [a] always for this prefix  [N] reject"
    } else {
        "[y] approve once  [N] reject"
    }
}

/// Parse one answer. Empty input rejects; `a` only counts when offered.
pub(crate) fn parse_approval_decision(input: &str, offer_similar: bool) -> Option<UserDecision> {
    let normalized = input.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "y" | "yes" => Some(UserDecision::ApproveOnce),
        "a" | "always" if offer_similar => Some(UserDecision::ApproveSimilar),
        "" | "n" | "no" => Some(UserDecision::Reject),
        "c" | "cancel" => Some(UserDecision::Cancel),
        _ => None,
    }
}

/// Ask on stderr until the answer parses. A closed stdin rejects.
pub(crate) async fn read_approval_decision(offer_similar: bool) -> UserDecision {
    loop {
        eprint!("approve? ");
        let _ = std::io::stderr().flush();
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|read| (read, line))
        })
        .await;
        let input = match line {
            Ok(Ok((read, line))) if read > 0 => line,
            _ => return UserDecision::Reject,
        };
        if let Some(decision) = parse_approval_decision(&input, offer_similar) {
            return decision;
        }
        eprintln!("{}", choices_hint(offer_similar));
    }
}
