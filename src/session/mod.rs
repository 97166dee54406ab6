//! Live agent runs.
//!
//! An [`AgentRun`] is one subprocess plus whatever protocol state it needs,
//! producing [`AgentEvent`]s on an ordered queue until a terminal event or
//! process exit. Two dialects implement it: the long-lived RPC app-server
//! ([`app_server`]) and the legacy one-shot `exec --json` stream ([`exec`]).

pub mod app_server;
pub mod exec;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub use app_server::{AppServerBackend, AppServerSession};
pub use exec::{ExecCliBackend, ExecRun};

use crate::command_tokens::split_command;
use crate::config::{ApprovalMode, BackendConfig, BackendDialect};
use crate::error::SessionError;
use crate::events::{AgentEvent, ApprovalKind, ApprovalRequest};
use crate::ids::{RunId, ThreadId};
use crate::machine::{Machine, RunHandle};

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

/// Ordered, unbounded event queue with a single terminating sentinel.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Option<AgentEvent>>,
    rx: Mutex<mpsc::UnboundedReceiver<Option<AgentEvent>>>,
    closed: AtomicBool,
    finished: AtomicBool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Returns `false` (and drops the event) once the queue is closed.
    pub fn push(&self, event: AgentEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(Some(event)).is_ok()
    }

    /// Push the sentinel. Only the first call has an effect.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(None);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next event, or `None` after the sentinel (and forever after).
    pub async fn next(&self) -> Option<AgentEvent> {
        if self.finished.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Some(event)) => Some(event),
            Some(None) | None => {
                self.finished.store(true, Ordering::SeqCst);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phases and decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    Active,
    WaitingApproval,
    Completed,
    Failed,
    /// Closed before any terminal event arrived.
    Closed,
}

impl SessionPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Closed)
    }
}

/// What the human chose for a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    ApproveOnce,
    /// Approve and trust the command's prefix from now on.
    ApproveSimilar,
    ApproveForSession,
    Reject,
    Cancel,
}

impl UserDecision {
    pub fn is_approval(self) -> bool {
        matches!(
            self,
            Self::ApproveOnce | Self::ApproveSimilar | Self::ApproveForSession
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApproveOnce => "once",
            Self::ApproveSimilar => "similar",
            Self::ApproveForSession => "session",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
        }
    }

    /// Legacy stream decision value.
    pub fn legacy_wire(self) -> &'static str {
        if self.is_approval() {
            "approved"
        } else {
            "denied"
        }
    }
}

impl fmt::Display for UserDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserDecision {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" | "approve" | "yes" | "y" => Ok(Self::ApproveOnce),
            "similar" => Ok(Self::ApproveSimilar),
            "session" => Ok(Self::ApproveForSession),
            "reject" | "no" | "n" => Ok(Self::Reject),
            "cancel" => Ok(Self::Cancel),
            other => Err(SessionError::InvalidDecision(other.to_string())),
        }
    }
}

/// RPC dialect decision values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcDecision {
    Accept,
    AcceptForSession,
    /// Accept and amend the backend's exec policy with a command prefix.
    AcceptWithExecpolicyAmendment(Vec<String>),
    Decline,
    Cancel,
}

impl RpcDecision {
    /// Map a user decision for an approval of `kind`; `prefix` is the
    /// canonical command prefix used for the amendment.
    pub fn from_user(decision: UserDecision, kind: ApprovalKind, prefix: &str) -> Self {
        match decision {
            UserDecision::ApproveOnce => Self::Accept,
            UserDecision::ApproveSimilar => match kind {
                ApprovalKind::CommandExecution if !prefix.trim().is_empty() => {
                    Self::AcceptWithExecpolicyAmendment(split_command(prefix))
                }
                _ => Self::AcceptForSession,
            },
            UserDecision::ApproveForSession => Self::AcceptForSession,
            UserDecision::Reject => Self::Decline,
            UserDecision::Cancel => Self::Cancel,
        }
    }

    /// The value stored under `result.decision`.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Accept => json!("accept"),
            Self::AcceptForSession => json!("acceptForSession"),
            Self::AcceptWithExecpolicyAmendment(amendment) => json!({
                "acceptWithExecpolicyAmendment": { "execpolicy_amendment": amendment }
            }),
            Self::Decline => json!("decline"),
            Self::Cancel => json!("cancel"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run and backend traits
// ---------------------------------------------------------------------------

/// Everything a backend needs to start one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub prompt: String,
    pub workdir: String,
    /// Resume this thread instead of starting a new one.
    pub thread_id: Option<ThreadId>,
    pub bin: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub sandbox: Option<String>,
    pub reasoning_effort: Option<String>,
    /// Policy string handed to the legacy CLI (`-a`).
    pub approval_policy: String,
    pub approval_mode: ApprovalMode,
    pub skip_git_repo_check: bool,
    pub developer_instructions: Option<String>,
    /// Grace period between terminate and kill on cancel.
    pub kill_grace: Duration,
}

impl StartRequest {
    pub fn from_config(
        backend: &BackendConfig,
        prompt: impl Into<String>,
        workdir: impl Into<String>,
        thread_id: Option<ThreadId>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.into(),
            thread_id,
            bin: backend.bin.clone(),
            args: backend.args.clone(),
            model: backend.model.clone(),
            sandbox: backend.sandbox.clone(),
            reasoning_effort: backend.reasoning_effort.clone(),
            approval_policy: backend.approval_policy.clone(),
            approval_mode: backend.approval_mode,
            skip_git_repo_check: backend.skip_git_repo_check,
            developer_instructions: backend.developer_instructions.clone(),
            kill_grace: Duration::from_millis(2_000),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// One live run, shared between the streaming turn and approval handlers.
#[async_trait]
pub trait AgentRun: Send + Sync {
    fn run_id(&self) -> &RunId;

    fn thread_id(&self) -> Option<ThreadId>;

    fn phase(&self) -> SessionPhase;

    /// Next event in wire order; `None` once the run closed.
    async fn next_event(&self) -> Option<AgentEvent>;

    /// Deliver a decision for `request` (previously surfaced by this run).
    /// `prefix` is the request's canonical command prefix.
    async fn resolve_approval(
        &self,
        request: &ApprovalRequest,
        prefix: &str,
        decision: UserDecision,
    ) -> Result<(), SessionError>;

    /// Whether the relay may gate tool starts itself (see proxy exec).
    fn supports_proxy_gating(&self) -> bool {
        false
    }

    /// Best-effort two-phase stop followed by `close`. Never fails.
    async fn cancel(&self);

    /// Idempotent: closes the connection and pushes the queue sentinel.
    fn close(&self);
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn dialect(&self) -> BackendDialect;

    async fn start_run(
        &self,
        machine: Arc<dyn Machine>,
        request: StartRequest,
    ) -> Result<Arc<dyn AgentRun>, SessionError>;
}

/// Backend implementation for the configured dialect.
pub fn backend_for(dialect: BackendDialect) -> Arc<dyn AgentBackend> {
    match dialect {
        BackendDialect::AppServer => Arc::new(AppServerBackend),
        BackendDialect::Exec => Arc::new(ExecCliBackend),
    }
}

/// Terminate, wait up to `grace`, then kill and close stdin.
pub(crate) async fn stop_process(handle: &dyn RunHandle, grace: Duration) {
    handle.terminate().await;
    if tokio::time::timeout(grace, handle.wait()).await.is_err() {
        debug!(grace_ms = grace.as_millis() as u64, "process ignored terminate; killing");
        handle.kill().await;
    }
    handle.close_stdin().await;
}

/// Resolve `workdir` on the machine, falling back to lexical normalization.
pub(crate) async fn resolve_workdir(machine: &dyn Machine, workdir: &str) -> String {
    match machine.realpath(workdir).await {
        Ok(resolved) if !resolved.is_empty() => resolved,
        _ => crate::machine::paths::normalize_path(workdir),
    }
}
