//! Legacy one-shot `exec --json` runs.
//!
//! Each turn is a fresh process. Events arrive as bare JSON lines on stdout
//! and approvals are written back to stdin as single JSON lines.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{stop_process, AgentBackend, AgentRun, EventQueue, SessionPhase, StartRequest, UserDecision};
use crate::config::BackendDialect;
use crate::error::SessionError;
use crate::events::{parse_event_obj, parse_json_line, AgentEvent, ApprovalRequest};
use crate::ids::{RunId, ThreadId};
use crate::machine::{output_channel, Machine, OutputStream, RunHandle, RunRequest, StdStream};
use crate::rpc::LineBuffer;

const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the backend CLI argv for one legacy turn.
pub fn build_argv(request: &StartRequest) -> Vec<String> {
    let mut argv = vec![request.bin.clone()];
    if let Some(sandbox) = &request.sandbox {
        argv.extend(["-s".to_string(), sandbox.clone()]);
    }
    argv.extend(["-a".to_string(), request.approval_policy.clone()]);
    argv.extend(["-C".to_string(), request.workdir.clone()]);
    if request.approval_policy == "untrusted" {
        // Ask every time even if the user's own config trusts this project.
        argv.extend([
            "-c".to_string(),
            format!("projects.\"{}\".trust_level=\"untrusted\"", request.workdir),
        ]);
    }
    if let Some(effort) = &request.reasoning_effort {
        argv.extend(["-c".to_string(), format!("model_reasoning_effort=\"{effort}\"")]);
    }
    argv.push("exec".into());
    if let Some(thread_id) = &request.thread_id {
        argv.extend(["resume".to_string(), thread_id.to_string()]);
    }
    argv.push("--json".into());
    if request.skip_git_repo_check {
        argv.push("--skip-git-repo-check".into());
    }
    if let Some(model) = &request.model {
        argv.extend(["-m".to_string(), model.clone()]);
    }
    argv.extend(request.args.iter().cloned());
    argv.push(request.prompt.clone());
    argv
}

/// The stdin line carrying a legacy approval decision.
pub fn approval_line(decision: &str, call_id: Option<&str>) -> Value {
    match call_id.filter(|id| !id.is_empty()) {
        Some(call_id) => json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "op": { "type": "exec_approval", "decision": decision, "call_id": call_id },
        }),
        None => json!({ "type": "exec_approval", "decision": decision }),
    }
}

struct ExecState {
    phase: SessionPhase,
    thread_id: Option<ThreadId>,
}

struct Shared {
    queue: EventQueue,
    state: Mutex<ExecState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.state();
        if !state.phase.is_finished() {
            state.phase = phase;
        }
    }

    fn push(&self, event: AgentEvent) {
        match &event {
            AgentEvent::ThreadStarted { thread_id } => {
                self.state().thread_id = Some(thread_id.clone());
            }
            AgentEvent::ExecApprovalRequest { .. } => self.set_phase(SessionPhase::WaitingApproval),
            AgentEvent::TurnCompleted { .. } => self.set_phase(SessionPhase::Completed),
            AgentEvent::TurnFailed { .. } => self.set_phase(SessionPhase::Failed),
            _ => {}
        }
        self.queue.push(event);
    }

    fn close(&self) {
        if self.queue.close() {
            self.set_phase(SessionPhase::Closed);
        }
    }

    fn push_stdout_line(&self, line: String) {
        match parse_json_line(&line) {
            Ok(obj) => {
                for event in parse_event_obj(&obj) {
                    self.push(event);
                }
            }
            Err(text) => self.push(AgentEvent::LogLine { text }),
        }
    }
}

async fn pump(shared: Arc<Shared>, mut output: OutputStream) {
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    while let Some(chunk) = output.recv().await {
        match chunk.stream {
            StdStream::Stdout => {
                for line in stdout.feed(&chunk.bytes) {
                    shared.push_stdout_line(line);
                }
            }
            StdStream::Stderr => {
                for text in stderr.feed(&chunk.bytes) {
                    shared.push(AgentEvent::LogLine { text });
                }
            }
        }
    }
    // A final line without a trailing newline still counts.
    for line in stdout.feed(b"\n") {
        shared.push_stdout_line(line);
    }
    for text in stderr.feed(b"\n") {
        shared.push(AgentEvent::LogLine { text });
    }
}

async fn reap(shared: Arc<Shared>, handle: Arc<dyn RunHandle>, pump: JoinHandle<()>) {
    let exit = handle.wait().await;
    let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
    match exit {
        Ok(0) => {}
        Ok(code) => {
            info!(code, "exec run exited");
            shared.push(AgentEvent::Error {
                message: format!("exited with {code}"),
            });
        }
        Err(err) => shared.push(AgentEvent::Error {
            message: format!("runner error: {err}"),
        }),
    }
    shared.close();
}

/// One legacy `exec --json` process.
pub struct ExecRun {
    run_id: RunId,
    handle: Arc<dyn RunHandle>,
    shared: Arc<Shared>,
    kill_grace: Duration,
}

impl ExecRun {
    /// Write one approval decision line to the process.
    pub async fn send_exec_approval(
        &self,
        decision: &str,
        call_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut line = serde_json::to_vec(&approval_line(decision, call_id))?;
        line.push(b'\n');
        self.handle.write_stdin(&line).await?;
        self.shared.set_phase(SessionPhase::Active);
        Ok(())
    }
}

#[async_trait]
impl AgentRun for ExecRun {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn thread_id(&self) -> Option<ThreadId> {
        self.shared.state().thread_id.clone()
    }

    fn phase(&self) -> SessionPhase {
        self.shared.state().phase
    }

    async fn next_event(&self) -> Option<AgentEvent> {
        self.shared.queue.next().await
    }

    async fn resolve_approval(
        &self,
        request: &ApprovalRequest,
        _prefix: &str,
        decision: UserDecision,
    ) -> Result<(), SessionError> {
        let call_id = request.correlation_id.as_ref().map(ToString::to_string);
        self.send_exec_approval(decision.legacy_wire(), call_id.as_deref())
            .await
    }

    fn supports_proxy_gating(&self) -> bool {
        true
    }

    async fn cancel(&self) {
        stop_process(self.handle.as_ref(), self.kill_grace).await;
        self.close();
    }

    fn close(&self) {
        self.shared.close();
    }
}

/// Starts [`ExecRun`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecCliBackend;

#[async_trait]
impl AgentBackend for ExecCliBackend {
    fn dialect(&self) -> BackendDialect {
        BackendDialect::Exec
    }

    async fn start_run(
        &self,
        machine: Arc<dyn Machine>,
        request: StartRequest,
    ) -> Result<Arc<dyn AgentRun>, SessionError> {
        let argv = build_argv(&request);
        debug!(machine = machine.name(), bin = %request.bin, resume = request.thread_id.is_some(), "spawning exec run");
        let (sink, output) = output_channel();
        let handle = machine
            .run(RunRequest::new(argv).with_cwd(request.workdir.clone()), sink)
            .await?;
        let shared = Arc::new(Shared {
            queue: EventQueue::new(),
            state: Mutex::new(ExecState {
                phase: SessionPhase::Active,
                thread_id: request.thread_id.clone(),
            }),
        });
        let pump_task = tokio::spawn(pump(shared.clone(), output));
        tokio::spawn(reap(shared.clone(), handle.clone(), pump_task));
        Ok(Arc::new(ExecRun {
            run_id: RunId::generate(),
            handle,
            shared,
            kill_grace: request.kill_grace,
        }))
    }
}
