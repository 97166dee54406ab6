//! Streaming one turn: event routing, approvals, proxy execution.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::failover::{
    can_fail_over, cancel_bounded, stall_failover_notice, unreachable_notice, NextEvent, Watchdog,
};
use super::{LiveRun, Orchestrator, LOG_PREVIEW_CHARS};
use crate::approval::intent::needs_write_approval;
use crate::approval::{command_tag, should_prompt_for_approval, ApprovalPolicy};
use crate::error::{OrchestratorError, SessionError};
use crate::events::{AgentEvent, ApprovalRequest, TokenUsageSnapshot, TurnUsage};
use crate::ids::{ConversationId, RunId};
use crate::machine::ExecResult;
use crate::session::UserDecision;
use crate::store::{ConversationState, PendingAction, RunStatus};
use crate::textutil::{
    command_preview, push_bounded, redact_secrets, truncate_tool_output,
    truncate_with_suffix_by_chars,
};

/// Shown when a turn ended without any user-visible output.
pub const NO_RESPONSE: &str = "(no response)";

/// Reason recorded on relay-gated commands.
const PROXY_EXEC_REASON: &str = "Approval policy is untrusted; the relay runs this command itself.";

/// Log lines kept for error reports.
const RECENT_LOG_CAP: usize = 30;
/// Log lines shown with an error when logs are hidden.
const ERROR_DETAIL_LINES: usize = 3;
const ERROR_DETAIL_LINE_CHARS: usize = 400;

/// Floor for tool output fed back to the agent.
const MIN_TOOL_REPORT_CHARS: usize = 20_000;
const THREAD_TITLE_CHARS: usize = 60;

/// How a front end sees a turn. Every method is called from the task that
/// drives the turn, except `heartbeat`, which runs on its own ticker.
#[async_trait]
pub trait TurnObserver: Send + Sync {
    /// A user-visible event, already filtered by the output settings.
    async fn on_event(&self, event: &AgentEvent);

    /// A relay-generated message (failover, errors, command results).
    async fn on_notice(&self, text: &str);

    /// A decision is needed. `offer_similar` is false when trusting a
    /// prefix would be pointless (the `untrusted` policy, proxy execution).
    async fn on_approval_required(&self, run_id: &RunId, pending: &PendingAction, offer_similar: bool);

    /// Liveness tick while a turn streams.
    async fn heartbeat(&self) {}
}

/// How a turn stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    Failed { message: String },
    /// The run is paused on a human decision; the conversation lock is released.
    AwaitingApproval { run_id: RunId, pending: PendingAction },
    Cancelled,
    /// The turn ended without user-visible output.
    NoResponse,
}

/// Calls `heartbeat` until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(observer: Arc<dyn TurnObserver>, every: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                observer.heartbeat().await;
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
struct TurnTracker {
    had_output: bool,
    completed: bool,
    /// A per-request usage update arrived during this turn.
    saw_request_usage: bool,
    turn_failure: Option<String>,
    last_error: Option<String>,
    recent_logs: Vec<String>,
}

enum Step {
    Continue,
    Stop(TurnOutcome),
}

impl Orchestrator {
    /// Stream `live` until the turn ends or pauses on an approval. Anything
    /// but a pause detaches and stops the run and clears the active row.
    pub(super) async fn stream(
        &self,
        conversation: &ConversationId,
        mut live: LiveRun,
        observer: Arc<dyn TurnObserver>,
        first_event_pending: bool,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let _heartbeat = Heartbeat::start(observer.clone(), self.config.output.heartbeat_interval());
        let result = self
            .drive(conversation, &mut live, observer.as_ref(), first_event_pending)
            .await;
        if !matches!(result, Ok(TurnOutcome::AwaitingApproval { .. })) {
            self.finish_run(conversation, &live).await;
        }
        match &result {
            Ok(outcome) => info!(conversation = %conversation, run_id = %live.run.run_id(), ?outcome, "turn stopped"),
            Err(err) => warn!(conversation = %conversation, run_id = %live.run.run_id(), error = %err, "turn aborted"),
        }
        result
    }

    async fn finish_run(&self, conversation: &ConversationId, live: &LiveRun) {
        self.detach(conversation, live.run.run_id());
        cancel_bounded(live.run.as_ref(), self.config.liveness.cancel_timeout()).await;
        if let Err(err) = self.store.clear_active_run(conversation) {
            warn!(conversation = %conversation, error = %err, "active run not cleared");
        }
    }

    /// Wind down a run whose session died while an approval was pending.
    /// The user gets exactly one message: the run's own error if it left one.
    pub(super) async fn abandon_closed_run(
        &self,
        conversation: &ConversationId,
        live: &LiveRun,
        err: &SessionError,
        observer: &dyn TurnObserver,
    ) -> TurnOutcome {
        let mut last_error = None;
        let drain = async {
            while let Some(event) = live.run.next_event().await {
                if let AgentEvent::Error { message } | AgentEvent::TurnFailed { message } = event {
                    last_error = Some(message);
                }
            }
        };
        if tokio::time::timeout(self.config.liveness.cancel_timeout(), drain)
            .await
            .is_err()
        {
            debug!(run_id = %live.run.run_id(), "closed run still draining; cancelling");
        }
        self.finish_run(conversation, live).await;
        warn!(conversation = %conversation, run_id = %live.run.run_id(), error = %err, "approval not delivered; session closed");

        let message = match last_error {
            Some(message) => {
                observer
                    .on_event(&AgentEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                message
            }
            None => {
                let message = format!("Approval not delivered: {err}");
                observer.on_notice(&message).await;
                message
            }
        };
        TurnOutcome::Failed { message }
    }

    async fn drive(
        &self,
        conversation: &ConversationId,
        live: &mut LiveRun,
        observer: &dyn TurnObserver,
        first_event_pending: bool,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let mut state = self.conversation(conversation)?;
        let mut entry = self.machine_entry(&live.machine)?;
        let mut watchdog = Watchdog::for_machine(entry.machine.kind(), &self.config.liveness);
        let mut tracker = TurnTracker::default();
        let mut first = first_event_pending;

        loop {
            let event = match watchdog.next_event(live.run.as_ref(), first).await {
                NextEvent::Event(event) => event,
                NextEvent::Finished => break,
                NextEvent::Stalled => {
                    if watchdog.is_reachable(entry.machine.as_ref()).await {
                        debug!(machine = %live.machine, "stalled but reachable; waiting");
                        continue;
                    }
                    let fallback = can_fail_over(entry.machine.kind())
                        .then(|| self.registry.fallback_for(&live.machine))
                        .flatten()
                        .cloned();
                    let fallback = match fallback {
                        Some(fallback) if !live.failover_used => fallback,
                        other => {
                            let message = unreachable_notice(&live.machine, other.is_some());
                            warn!(machine = %live.machine, "machine unreachable; ending turn");
                            observer.on_notice(&message).await;
                            return Ok(TurnOutcome::Failed { message });
                        }
                    };

                    let fallback_name = fallback.machine.name().to_string();
                    warn!(machine = %live.machine, fallback = %fallback_name, "machine unreachable; failing over");
                    observer
                        .on_notice(&stall_failover_notice(&live.machine, &fallback_name))
                        .await;
                    cancel_bounded(live.run.as_ref(), watchdog.cancel_timeout()).await;

                    state = self.move_to_fallback(conversation, &fallback)?;
                    let request = self.start_request(&state, &fallback.def, &live.prompt, None);
                    let run = match self.backend.start_run(fallback.machine.clone(), request).await {
                        Ok(run) => run,
                        Err(err) => {
                            let message = format!("Failed to start run on '{fallback_name}': {err}");
                            observer.on_notice(&message).await;
                            return Ok(TurnOutcome::Failed { message });
                        }
                    };
                    *live = LiveRun {
                        run,
                        machine: fallback_name,
                        prompt: live.prompt.clone(),
                        failover_used: true,
                    };
                    self.attach(conversation, live.clone());
                    self.store
                        .set_active_run(conversation, live.run.run_id(), RunStatus::Running, None)?;
                    watchdog = Watchdog::for_machine(fallback.machine.kind(), &self.config.liveness);
                    entry = fallback;
                    tracker.recent_logs.clear();
                    first = true;
                    continue;
                }
            };
            first = false;

            match self
                .handle_event(conversation, &mut state, live, event, &mut tracker, observer)
                .await?
            {
                Step::Continue => {}
                Step::Stop(outcome) => return Ok(outcome),
            }
        }

        if !self.is_attached(conversation, live.run.run_id()) {
            return Ok(TurnOutcome::Cancelled);
        }
        if let Some(message) = tracker.turn_failure {
            return Ok(TurnOutcome::Failed { message });
        }
        if !tracker.completed {
            if let Some(message) = tracker.last_error {
                return Ok(TurnOutcome::Failed { message });
            }
        }
        if !tracker.had_output {
            observer.on_notice(NO_RESPONSE).await;
            return Ok(TurnOutcome::NoResponse);
        }
        Ok(TurnOutcome::Completed)
    }

    async fn handle_event(
        &self,
        conversation: &ConversationId,
        state: &mut ConversationState,
        live: &LiveRun,
        event: AgentEvent,
        tracker: &mut TurnTracker,
        observer: &dyn TurnObserver,
    ) -> Result<Step, OrchestratorError> {
        let output = &self.config.output;
        match event {
            AgentEvent::ThreadStarted { thread_id } => {
                if state.thread_id.as_ref() != Some(&thread_id) {
                    let title = state
                        .thread_id
                        .is_none()
                        .then(|| thread_title(&live.prompt));
                    self.store
                        .set_thread(conversation, &thread_id, title.as_deref())?;
                    *state = self.conversation(conversation)?;
                    info!(conversation = %conversation, thread = %thread_id, "thread recorded");
                }
            }
            AgentEvent::TurnStarted { turn_id } => {
                debug!(run_id = %live.run.run_id(), turn = ?turn_id, "turn started");
            }
            AgentEvent::TurnCompleted { usage } => {
                tracker.completed = true;
                if let Some(usage) = usage.filter(|_| !tracker.saw_request_usage) {
                    self.store
                        .update_token_telemetry(conversation, &turn_usage_snapshot(&usage))?;
                }
            }
            AgentEvent::TurnFailed { ref message } => {
                tracker.turn_failure = Some(message.clone());
                tracker.had_output = true;
                observer.on_event(&event).await;
            }
            AgentEvent::AgentMessageDelta { .. } | AgentEvent::AgentMessage { .. } => {
                tracker.had_output = true;
                observer.on_event(&event).await;
            }
            AgentEvent::ReasoningDelta { .. } => {
                if output.show_reasoning {
                    tracker.had_output = true;
                    observer.on_event(&event).await;
                }
            }
            AgentEvent::TokenUsage { usage } => {
                tracker.saw_request_usage |= usage.input_tokens.is_some() || usage.output_tokens.is_some();
                self.store.update_token_telemetry(conversation, &usage)?;
            }
            AgentEvent::ExecApprovalRequest { request } => {
                return self
                    .request_approval(conversation, state, live, request, observer)
                    .await;
            }
            AgentEvent::ToolStarted { command } => {
                let policy = ApprovalPolicy::parse(&state.approval_policy);
                if policy == ApprovalPolicy::Untrusted
                    && live.run.supports_proxy_gating()
                    && needs_write_approval(&command)
                {
                    return self
                        .gate_tool_start(conversation, state, live, command, observer)
                        .await;
                }
                if output.show_tool_output {
                    observer.on_event(&AgentEvent::ToolStarted { command }).await;
                }
            }
            AgentEvent::ExecOutputDelta { .. } => {}
            AgentEvent::ExecEnd {
                exit_code,
                aggregated_output,
            } => {
                if output.show_tool_output && aggregated_output.is_some() {
                    let aggregated_output = aggregated_output.map(|text| {
                        truncate_with_suffix_by_chars(
                            &text,
                            output.max_tool_output_chars,
                            "\n...(truncated)...\n",
                        )
                    });
                    observer
                        .on_event(&AgentEvent::ExecEnd {
                            exit_code,
                            aggregated_output,
                        })
                        .await;
                }
            }
            AgentEvent::LogLine { ref text } => {
                push_bounded(&mut tracker.recent_logs, text.clone(), RECENT_LOG_CAP);
                if output.show_logs {
                    observer.on_event(&event).await;
                }
            }
            AgentEvent::Error { ref message } => {
                warn!(conversation = %conversation, run_id = %live.run.run_id(), message = %redact_secrets(message), "run error");
                tracker.last_error = Some(message.clone());
                tracker.had_output = true;
                observer.on_event(&event).await;
                if !output.show_logs && !tracker.recent_logs.is_empty() {
                    observer
                        .on_notice(&error_details(&tracker.recent_logs))
                        .await;
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Auto-approve trusted commands; otherwise record and surface the request.
    async fn request_approval(
        &self,
        conversation: &ConversationId,
        state: &ConversationState,
        live: &LiveRun,
        request: ApprovalRequest,
        observer: &dyn TurnObserver,
    ) -> Result<Step, OrchestratorError> {
        let run_id = live.run.run_id().clone();
        let policy = ApprovalPolicy::parse(&state.approval_policy);
        let thread = live.run.thread_id().or_else(|| state.thread_id.clone());
        let trusted = match &thread {
            Some(thread) => self
                .store
                .list_trusted_prefixes(&live.machine, thread.as_str())?,
            None => BTreeSet::new(),
        };
        let check = should_prompt_for_approval(
            &policy,
            &request.command,
            &trusted,
            self.config.approvals.prefix_tokens,
        );
        let tag = command_tag(&request.command);

        if !check.needs_prompt {
            info!(
                conversation = %conversation,
                %run_id,
                command_tag = %tag,
                prefix = %check.canonical_prefix,
                "auto-approving trusted command"
            );
            if let Err(err) = live
                .run
                .resolve_approval(&request, &check.canonical_prefix, UserDecision::ApproveOnce)
                .await
            {
                warn!(%run_id, command_tag = %tag, error = %err, "auto-approval not delivered");
                observer
                    .on_notice(&format!("Failed to send approval: {err}"))
                    .await;
            }
            return Ok(Step::Continue);
        }

        let pending = PendingAction::ExecApproval {
            request,
            prefix: check.canonical_prefix,
            thread_id: thread,
        };
        self.store.set_active_run(
            conversation,
            &run_id,
            RunStatus::WaitingApproval,
            Some(pending.clone()),
        )?;
        info!(
            conversation = %conversation,
            %run_id,
            command_tag = %tag,
            command = %command_preview(pending.command(), LOG_PREVIEW_CHARS),
            "approval required"
        );
        observer
            .on_approval_required(&run_id, &pending, policy != ApprovalPolicy::Untrusted)
            .await;
        Ok(Step::Stop(TurnOutcome::AwaitingApproval { run_id, pending }))
    }

    /// Stop a run that started a write-like command under `untrusted`; the
    /// command runs only if a human approves it.
    async fn gate_tool_start(
        &self,
        conversation: &ConversationId,
        state: &ConversationState,
        live: &LiveRun,
        command: String,
        observer: &dyn TurnObserver,
    ) -> Result<Step, OrchestratorError> {
        let run_id = live.run.run_id().clone();
        let pending = PendingAction::ProxyExec {
            command,
            cwd: state.workdir.clone(),
            reason: Some(PROXY_EXEC_REASON.to_string()),
        };
        self.store.set_active_run(
            conversation,
            &run_id,
            RunStatus::WaitingApproval,
            Some(pending.clone()),
        )?;
        info!(
            conversation = %conversation,
            %run_id,
            command_tag = %command_tag(pending.command()),
            command = %command_preview(pending.command(), LOG_PREVIEW_CHARS),
            "gating tool start behind approval"
        );
        observer.on_approval_required(&run_id, &pending, false).await;
        self.detach(conversation, &run_id);
        cancel_bounded(live.run.as_ref(), self.config.liveness.cancel_timeout()).await;
        Ok(Step::Stop(TurnOutcome::AwaitingApproval { run_id, pending }))
    }

    /// Resolve a gated command: run it on the conversation's machine and feed
    /// the result back as the next message, or drop it.
    pub(super) async fn run_proxy_exec(
        &self,
        conversation: &ConversationId,
        run_id: &RunId,
        command: String,
        cwd: String,
        decision: UserDecision,
        observer: Arc<dyn TurnObserver>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let tag = command_tag(&command);
        if command.trim().is_empty() {
            self.store.clear_active_run(conversation)?;
            return Err(OrchestratorError::NoPendingApproval);
        }
        if !decision.is_approval() {
            info!(conversation = %conversation, %run_id, kind = "proxy_exec", %decision, command_tag = %tag, "approval decision");
            self.store.clear_active_run(conversation)?;
            observer.on_notice("Rejected.").await;
            return Ok(TurnOutcome::Cancelled);
        }

        let state = self.conversation(conversation)?;
        let cwd = if cwd.trim().is_empty() {
            state.workdir.clone()
        } else {
            cwd
        };
        let entry = self.machine_entry(&state.machine)?;
        // Cleared up front so a failing command can not leave the conversation stuck.
        self.store.clear_active_run(conversation)?;

        info!(
            conversation = %conversation,
            %run_id,
            machine = %state.machine,
            command_tag = %tag,
            command = %command_preview(&command, LOG_PREVIEW_CHARS),
            "proxy exec start"
        );
        let argv = vec!["bash".to_string(), "-lc".to_string(), command.clone()];
        let result = match entry.machine.exec_capture(&argv, Some(&cwd)).await {
            Ok(result) => result,
            Err(err) => {
                observer
                    .on_notice(&format!("Command failed to start: {err}"))
                    .await;
                return Err(err.into());
            }
        };
        info!(%run_id, exit_code = result.exit_code, command_tag = %tag, "proxy exec end");
        if result.exit_code != 0 {
            observer
                .on_notice(&format!("Command failed (exit code: {}).", result.exit_code))
                .await;
        }

        let report = tool_output_report(&command, &result, self.config.output.max_tool_output_chars);
        self.begin_turn(conversation, report, observer).await
    }
}

/// The message that hands a relay-executed command's result back to the agent.
pub(crate) fn tool_output_report(command: &str, result: &ExecResult, max_chars: usize) -> String {
    let cap = max_chars.max(MIN_TOOL_REPORT_CHARS);
    format!(
        "[Tool output]\nCommand: {command}\nExit code: {}\nSTDOUT:\n{}\nSTDERR:\n{}\nContinue.",
        result.exit_code,
        truncate_tool_output(&result.stdout, cap),
        truncate_tool_output(&result.stderr, cap),
    )
}

/// First non-blank line of the prompt, whitespace collapsed and bounded.
pub(crate) fn thread_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_suffix_by_chars(&collapsed, THREAD_TITLE_CHARS, "...")
}

fn error_details(recent_logs: &[String]) -> String {
    let start = recent_logs.len().saturating_sub(ERROR_DETAIL_LINES);
    let lines: Vec<String> = recent_logs[start..]
        .iter()
        .map(|line| truncate_with_suffix_by_chars(line, ERROR_DETAIL_LINE_CHARS, "..."))
        .collect();
    format!("Details:\n{}", lines.join("\n"))
}

/// Counts summed over every model request of the turn. The legacy stream has
/// nothing finer, so they stand in for the last-request fields only when no
/// per-request update arrived. Total tokens stay unset so context remaining is
/// never derived from the sum.
fn turn_usage_snapshot(usage: &TurnUsage) -> TokenUsageSnapshot {
    TokenUsageSnapshot {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_input_tokens: usage.cached_input_tokens,
        ..TokenUsageSnapshot::default()
    }
}
