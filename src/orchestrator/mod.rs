//! Conversation-level turn orchestration.
//!
//! The [`Orchestrator`] is the single authority over live runs. It owns the
//! per-conversation locks, the map of attached runs, and every write to the
//! active-run row in the [`StateStore`]. Front ends call its public
//! operations and render through a [`TurnObserver`].
//!
//! Live runs are process-local. After a restart the store may still hold an
//! active-run row; approvals against it fail with
//! [`OrchestratorError::RunHandleMissing`] and `cancel_turn` clears it.

mod failover;
pub mod turn;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

pub use turn::{TurnObserver, TurnOutcome};

use crate::approval::{command_tag, ApprovalPolicy};
use crate::config::{BackendDialect, Config, MachineDef};
use crate::error::{OrchestratorError, SessionError};
use crate::ids::{ConversationId, RunId};
use crate::machine::{MachineEntry, MachineRegistry};
use crate::session::{backend_for, AgentBackend, AgentRun, SessionPhase, StartRequest, UserDecision};
use crate::store::{ActiveRun, ConversationDefaults, ConversationState, PendingAction, RunStatus, StateStore};
use crate::textutil::command_preview;

use failover::{can_fail_over, cancel_bounded, setup_failover_notice};

/// Sandbox forced on the legacy dialect under `untrusted`, so writes can only
/// happen through relay-executed commands.
const READ_ONLY_SANDBOX: &str = "read-only";

/// Longest command preview written to logs.
const LOG_PREVIEW_CHARS: usize = 160;

/// A run attached to a conversation, plus what a failover needs to redo it.
#[derive(Clone)]
pub(crate) struct LiveRun {
    pub run: Arc<dyn AgentRun>,
    pub machine: String,
    pub prompt: String,
    /// Set once this user message already failed over.
    pub failover_used: bool,
}

/// Snapshot returned by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct ConversationStatus {
    pub state: ConversationState,
    pub active_run: Option<ActiveRun>,
    /// Phase of the run attached in this process, if any.
    pub attached_phase: Option<SessionPhase>,
}

pub struct Orchestrator {
    config: Config,
    registry: MachineRegistry,
    backend: Arc<dyn AgentBackend>,
    store: Arc<dyn StateStore>,
    live: Mutex<HashMap<ConversationId, LiveRun>>,
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: MachineRegistry,
        backend: Arc<dyn AgentBackend>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            registry,
            backend,
            store,
            live: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Machines and backend built straight from `config`.
    pub fn from_config(config: Config, store: Arc<dyn StateStore>) -> Self {
        let registry = MachineRegistry::from_config(&config.machines);
        let backend = backend_for(config.backend.dialect);
        Self::new(config, registry, backend, store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Start a turn for a user message, resuming the conversation's thread
    /// when it has one. Fails with `RunInProgress` without spawning anything
    /// while another turn (or a pending approval) holds the conversation.
    pub async fn start_turn(
        &self,
        conversation: &ConversationId,
        prompt: &str,
        observer: Arc<dyn TurnObserver>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let _guard = self
            .lock_for(conversation)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::RunInProgress)?;
        self.begin_turn(conversation, prompt.to_string(), observer).await
    }

    /// Send a message on the conversation's existing thread.
    pub async fn send_followup(
        &self,
        conversation: &ConversationId,
        text: &str,
        observer: Arc<dyn TurnObserver>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let _guard = self
            .lock_for(conversation)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::RunInProgress)?;
        if self.conversation(conversation)?.thread_id.is_none() {
            return Err(OrchestratorError::NoThread);
        }
        self.begin_turn(conversation, text.to_string(), observer).await
    }

    /// Apply a human decision to the pending approval of `run_id`.
    ///
    /// Nothing is mutated when `run_id` is not the recorded active run. The
    /// pending record is cleared only after the decision was delivered, and
    /// the turn then keeps streaming until its next stop. A session that died
    /// in the meantime ends the turn as `Failed` and frees the conversation.
    pub async fn respond_approval(
        &self,
        conversation: &ConversationId,
        run_id: &RunId,
        decision: UserDecision,
        observer: Arc<dyn TurnObserver>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let _guard = self.lock_for(conversation).lock_owned().await;
        let active = self
            .store
            .get_active_run(conversation)?
            .filter(|active| &active.run_id == run_id)
            .ok_or(OrchestratorError::StaleApproval)?;
        let pending = active.pending.ok_or(OrchestratorError::NoPendingApproval)?;

        match pending {
            PendingAction::ExecApproval {
                request,
                prefix,
                thread_id,
            } => {
                let Some(live) = self
                    .live_run(conversation)
                    .filter(|live| live.run.run_id() == run_id)
                else {
                    self.store.clear_active_run(conversation)?;
                    return Err(OrchestratorError::RunHandleMissing);
                };
                if decision == UserDecision::ApproveSimilar && !prefix.trim().is_empty() {
                    if let Some(thread) = &thread_id {
                        let added = self.store.add_trusted_prefix(&live.machine, thread.as_str(), &prefix)?;
                        info!(machine = %live.machine, thread = %thread, %prefix, added, "trusted prefix");
                    }
                }
                info!(
                    conversation = %conversation,
                    %run_id,
                    kind = "exec_approval",
                    %decision,
                    command_tag = %command_tag(&request.command),
                    command = %command_preview(&request.command, LOG_PREVIEW_CHARS),
                    "approval decision"
                );
                let delivered = if live.run.phase().is_finished() {
                    Err(SessionError::Closed)
                } else {
                    live.run.resolve_approval(&request, &prefix, decision).await
                };
                match delivered {
                    Ok(()) => {}
                    Err(err) if err.is_session_gone() || live.run.phase().is_finished() => {
                        return Ok(self
                            .abandon_closed_run(conversation, &live, &err, observer.as_ref())
                            .await);
                    }
                    Err(err) => return Err(err.into()),
                }
                self.store
                    .set_active_run(conversation, run_id, RunStatus::Running, None)?;
                self.stream(conversation, live, observer, false).await
            }
            PendingAction::ProxyExec { command, cwd, .. } => {
                self.run_proxy_exec(conversation, run_id, command, cwd, decision, observer)
                    .await
            }
        }
    }

    /// Cancel whatever run the conversation has. Returns whether there was one.
    pub async fn cancel_turn(&self, conversation: &ConversationId) -> Result<bool, OrchestratorError> {
        let live = self.take_live(conversation);
        let had_row = self.store.get_active_run(conversation)?.is_some();
        if let Some(live) = &live {
            info!(conversation = %conversation, run_id = %live.run.run_id(), "cancelling run");
            cancel_bounded(live.run.as_ref(), self.config.liveness.cancel_timeout()).await;
        }
        self.store.clear_active_run(conversation)?;
        Ok(live.is_some() || had_row)
    }

    pub fn status(&self, conversation: &ConversationId) -> Result<ConversationStatus, OrchestratorError> {
        Ok(ConversationStatus {
            state: self.conversation(conversation)?,
            active_run: self.store.get_active_run(conversation)?,
            attached_phase: self.live_run(conversation).map(|live| live.run.phase()),
        })
    }

    /// Point the conversation at another machine; the next turn starts a new thread.
    pub fn switch_machine(&self, conversation: &ConversationId, machine: &str) -> Result<(), OrchestratorError> {
        let entry = self.machine_entry(machine)?;
        self.conversation(conversation)?;
        self.store
            .set_machine(conversation, machine, &entry.def.default_workdir)?;
        Ok(())
    }

    /// Forget the conversation's thread so the next turn starts fresh.
    pub fn new_thread(&self, conversation: &ConversationId) -> Result<(), OrchestratorError> {
        self.conversation(conversation)?;
        self.store.clear_thread(conversation)?;
        Ok(())
    }

    pub fn set_approval_policy(&self, conversation: &ConversationId, policy: &str) -> Result<(), OrchestratorError> {
        if let ApprovalPolicy::Other(other) = ApprovalPolicy::parse(policy) {
            return Err(OrchestratorError::InvalidPolicy(other));
        }
        self.conversation(conversation)?;
        self.store.set_approval_policy(conversation, policy.trim())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Turn setup
    // -----------------------------------------------------------------------

    /// Start a run and stream it. The caller holds the conversation lock.
    async fn begin_turn(
        &self,
        conversation: &ConversationId,
        prompt: String,
        observer: Arc<dyn TurnObserver>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        if let Some(active) = self.store.get_active_run(conversation)? {
            info!(
                conversation = %conversation,
                run_id = %active.run_id,
                status = active.status.as_str(),
                "rejecting turn; run in progress"
            );
            return Err(OrchestratorError::RunInProgress);
        }
        let state = self.conversation(conversation)?;
        let live = self
            .launch(conversation, &state, prompt, observer.as_ref())
            .await?;
        self.store
            .set_active_run(conversation, live.run.run_id(), RunStatus::Running, None)?;
        self.attach(conversation, live.clone());
        self.stream(conversation, live, observer, true).await
    }

    /// Start a run on the conversation's machine, failing over once when a
    /// remote machine can not even start it.
    async fn launch(
        &self,
        conversation: &ConversationId,
        state: &ConversationState,
        prompt: String,
        observer: &dyn TurnObserver,
    ) -> Result<LiveRun, OrchestratorError> {
        let entry = self.machine_entry(&state.machine)?;
        let request = self.start_request(state, &entry.def, &prompt, state.thread_id.clone());
        info!(
            conversation = %conversation,
            machine = %state.machine,
            resume = state.thread_id.is_some(),
            "starting run"
        );
        let err = match self.backend.start_run(entry.machine.clone(), request).await {
            Ok(run) => {
                return Ok(LiveRun {
                    run,
                    machine: state.machine.clone(),
                    prompt,
                    failover_used: false,
                })
            }
            Err(err) => err,
        };

        let fallback = can_fail_over(entry.machine.kind())
            .then(|| self.registry.fallback_for(&state.machine))
            .flatten()
            .cloned();
        let Some(fallback) = fallback else {
            return Err(OrchestratorError::Start(format!("{}: {err}", state.machine)));
        };
        let fallback_name = fallback.machine.name().to_string();
        warn!(machine = %state.machine, fallback = %fallback_name, error = %err, "run setup failed; failing over");
        observer
            .on_notice(&setup_failover_notice(&state.machine, &fallback_name, &err))
            .await;

        let state = self.move_to_fallback(conversation, &fallback)?;
        let request = self.start_request(&state, &fallback.def, &prompt, None);
        let run = self
            .backend
            .start_run(fallback.machine.clone(), request)
            .await
            .map_err(|err| OrchestratorError::Start(format!("{fallback_name}: {err}")))?;
        Ok(LiveRun {
            run,
            machine: fallback_name,
            prompt,
            failover_used: true,
        })
    }

    /// Switch the conversation to `fallback` (new thread) and return its state.
    fn move_to_fallback(
        &self,
        conversation: &ConversationId,
        fallback: &MachineEntry,
    ) -> Result<ConversationState, OrchestratorError> {
        self.store.set_machine(
            conversation,
            fallback.machine.name(),
            &fallback.def.default_workdir,
        )?;
        self.conversation(conversation)
    }

    fn start_request(
        &self,
        state: &ConversationState,
        def: &MachineDef,
        prompt: &str,
        thread: Option<crate::ids::ThreadId>,
    ) -> StartRequest {
        let mut request = StartRequest::from_config(&self.config.backend, prompt, &state.workdir, thread)
            .with_kill_grace(self.config.liveness.kill_grace());
        if let Some(bin) = &def.backend_bin {
            request.bin = bin.clone();
        }
        if state.model.is_some() {
            request.model = state.model.clone();
        }
        if state.reasoning_effort.is_some() {
            request.reasoning_effort = state.reasoning_effort.clone();
        }
        request.approval_policy = state.approval_policy.clone();
        if self.backend.dialect() == BackendDialect::Exec
            && ApprovalPolicy::parse(&state.approval_policy) == ApprovalPolicy::Untrusted
        {
            request.sandbox = Some(READ_ONLY_SANDBOX.to_string());
        }
        request
    }

    // -----------------------------------------------------------------------
    // Shared state helpers
    // -----------------------------------------------------------------------

    fn defaults(&self) -> Result<ConversationDefaults, OrchestratorError> {
        let machine = self.registry.default_name().to_string();
        let entry = self.machine_entry(&machine)?;
        Ok(ConversationDefaults {
            workdir: entry.def.default_workdir.clone(),
            machine,
            approval_policy: self.config.backend.approval_policy.clone(),
            model: self.config.backend.model.clone(),
            reasoning_effort: self.config.backend.reasoning_effort.clone(),
        })
    }

    fn conversation(&self, conversation: &ConversationId) -> Result<ConversationState, OrchestratorError> {
        Ok(self.store.ensure_conversation(conversation, &self.defaults()?)?)
    }

    fn machine_entry(&self, name: &str) -> Result<MachineEntry, OrchestratorError> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownMachine(name.to_string()))
    }

    fn lock_for(&self, conversation: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(conversation.clone()).or_default().clone()
    }

    fn live_map(&self) -> MutexGuard<'_, HashMap<ConversationId, LiveRun>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_run(&self, conversation: &ConversationId) -> Option<LiveRun> {
        self.live_map().get(conversation).cloned()
    }

    fn attach(&self, conversation: &ConversationId, live: LiveRun) {
        self.live_map().insert(conversation.clone(), live);
    }

    fn take_live(&self, conversation: &ConversationId) -> Option<LiveRun> {
        self.live_map().remove(conversation)
    }

    fn is_attached(&self, conversation: &ConversationId, run_id: &RunId) -> bool {
        self.live_map()
            .get(conversation)
            .is_some_and(|live| live.run.run_id() == run_id)
    }

    /// Remove the attached run only if it is still `run_id`.
    fn detach(&self, conversation: &ConversationId, run_id: &RunId) -> bool {
        let mut live = self.live_map();
        if live
            .get(conversation)
            .is_some_and(|attached| attached.run.run_id() == run_id)
        {
            live.remove(conversation);
            true
        } else {
            false
        }
    }
}
