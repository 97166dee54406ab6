//! Long-lived `app-server` JSON-RPC session.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    resolve_workdir, stop_process, AgentBackend, AgentRun, EventQueue, RpcDecision,
    SessionPhase, StartRequest, UserDecision,
};
use crate::build_info::{CLIENT_NAME, VERSION};
use crate::config::{ApprovalMode, BackendDialect};
use crate::error::SessionError;
use crate::events::app_server::{map_notification, map_server_request};
use crate::events::{AgentEvent, ApprovalKind, ApprovalRequest};
use crate::ids::{RequestId, RunId, ThreadId, TurnId};
use crate::machine::{output_channel, Machine, OutputStream, RunHandle, RunRequest, StdStream};
use crate::rpc::{Inbound, JsonRpcConnection};

/// Upper bound on how long the reaper waits for the pump to drain after exit.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    thread_id: Option<ThreadId>,
    turn_id: Option<TurnId>,
}

/// State shared with the pump and reaper tasks.
struct Shared {
    rpc: JsonRpcConnection,
    queue: EventQueue,
    state: Mutex<SessionState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.state();
        if !state.phase.is_finished() {
            state.phase = phase;
        }
    }

    /// Move to `to` only while the phase is still `from`.
    fn advance_phase(&self, from: SessionPhase, to: SessionPhase) -> bool {
        let mut state = self.state();
        if state.phase != from {
            return false;
        }
        state.phase = to;
        true
    }

    fn push(&self, event: AgentEvent) {
        match &event {
            AgentEvent::ThreadStarted { thread_id } => {
                self.state().thread_id = Some(thread_id.clone());
            }
            AgentEvent::TurnStarted { turn_id: Some(turn_id) } => {
                self.state().turn_id = Some(turn_id.clone());
            }
            AgentEvent::ExecApprovalRequest { .. } => self.set_phase(SessionPhase::WaitingApproval),
            AgentEvent::TurnCompleted { .. } => self.set_phase(SessionPhase::Completed),
            AgentEvent::TurnFailed { .. } => self.set_phase(SessionPhase::Failed),
            _ => {}
        }
        self.queue.push(event);
    }

    fn close(&self) {
        self.rpc.close();
        if self.queue.close() {
            self.set_phase(SessionPhase::Closed);
            debug!("app-server session closed");
        }
    }

    async fn dispatch(&self, message: Inbound) {
        match message {
            Inbound::Log(text) => self.push(AgentEvent::LogLine { text }),
            Inbound::Notification(note) => {
                for event in map_notification(note.method(), &note.params()) {
                    let terminal = event.is_terminal();
                    self.push(event);
                    if terminal {
                        self.close();
                    }
                }
            }
            Inbound::Request(request) => {
                let Some(id) = request.id() else {
                    return;
                };
                match map_server_request(&id, request.method(), &request.params()) {
                    Some(event) => self.push(event),
                    None => {
                        warn!(method = request.method(), %id, "declining unknown server request");
                        if let Err(err) = self.rpc.respond(&id, json!({"decision": "decline"})).await {
                            debug!(error = %err, "decline for unknown server request not sent");
                        }
                    }
                }
            }
        }
    }
}

async fn pump(shared: Arc<Shared>, mut output: OutputStream) {
    while let Some(chunk) = output.recv().await {
        let inbound = match chunk.stream {
            StdStream::Stdout => shared.rpc.feed_stdout(&chunk.bytes),
            StdStream::Stderr => shared.rpc.feed_stderr(&chunk.bytes),
        };
        for message in inbound {
            shared.dispatch(message).await;
        }
    }
}

async fn reap(shared: Arc<Shared>, handle: Arc<dyn RunHandle>, pump: JoinHandle<()>) {
    let exit = handle.wait().await;
    // Let buffered output reach the queue before any exit error.
    let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
    match exit {
        Ok(0) => {}
        Ok(code) => {
            info!(code, "app-server exited");
            shared.push(AgentEvent::Error {
                message: format!("agent app-server exited with {code}"),
            });
        }
        Err(err) => shared.push(AgentEvent::Error {
            message: format!("runner error: {err}"),
        }),
    }
    shared.close();
}

/// One `app-server` process driving a single turn.
pub struct AppServerSession {
    run_id: RunId,
    handle: Arc<dyn RunHandle>,
    shared: Arc<Shared>,
    kill_grace: Duration,
}

impl AppServerSession {
    pub fn turn_id(&self) -> Option<TurnId> {
        self.shared.state().turn_id.clone()
    }

    /// Answer the server request `correlation_id` with `decision`.
    pub async fn respond_approval(
        &self,
        correlation_id: &RequestId,
        kind: ApprovalKind,
        decision: RpcDecision,
    ) -> Result<(), SessionError> {
        if matches!(decision, RpcDecision::AcceptWithExecpolicyAmendment(_))
            && kind != ApprovalKind::CommandExecution
        {
            return Err(SessionError::InvalidDecision(
                "exec policy amendments only apply to command approvals".into(),
            ));
        }
        if kind == ApprovalKind::LegacyExec {
            return Err(SessionError::InvalidDecision(
                "legacy approvals cannot be answered over rpc".into(),
            ));
        }
        self.shared
            .rpc
            .respond(correlation_id, json!({ "decision": decision.to_wire() }))
            .await?;
        self.shared
            .advance_phase(SessionPhase::WaitingApproval, SessionPhase::Active);
        Ok(())
    }

    async fn handshake(&self, request: &StartRequest, workdir: &str) -> Result<(), SessionError> {
        let rpc = &self.shared.rpc;
        rpc.request(
            "initialize",
            json!({ "clientInfo": { "name": CLIENT_NAME, "version": VERSION } }),
        )
        .await?;

        let mut thread_params = thread_params(request, workdir);
        let method = match &request.thread_id {
            Some(thread_id) => {
                thread_params.insert("threadId".into(), json!(thread_id));
                "thread/resume"
            }
            None => "thread/start",
        };
        let result = rpc.request(method, Value::Object(thread_params)).await?;
        let thread_id = result
            .pointer("/thread/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SessionError::Protocol(format!("{method} returned no thread id")))?;
        let thread_id = ThreadId::new(thread_id);
        info!(run_id = %self.run_id, %thread_id, method, "thread ready");
        self.shared.push(AgentEvent::ThreadStarted {
            thread_id: thread_id.clone(),
        });

        let mut turn_params = Map::new();
        turn_params.insert("threadId".into(), json!(thread_id));
        turn_params.insert(
            "input".into(),
            json!([{ "type": "text", "text": request.prompt }]),
        );
        if let Some(model) = &request.model {
            turn_params.insert("model".into(), json!(model));
        }
        if let Some(effort) = &request.reasoning_effort {
            turn_params.insert("effort".into(), json!(effort));
        }
        let result = rpc.request("turn/start", Value::Object(turn_params)).await?;
        if let Some(turn_id) = result.pointer("/turn/id").and_then(Value::as_str) {
            self.shared.state().turn_id = Some(TurnId::new(turn_id));
        }
        // The pump may already have seen an approval request or the end of the turn.
        self.shared
            .advance_phase(SessionPhase::Starting, SessionPhase::Active);
        Ok(())
    }
}

fn thread_params(request: &StartRequest, workdir: &str) -> Map<String, Value> {
    let approval_policy = match request.approval_mode {
        ApprovalMode::Yolo => "never",
        ApprovalMode::Guarded => "on-request",
    };
    let mut params = Map::new();
    params.insert("cwd".into(), json!(workdir));
    params.insert("approvalPolicy".into(), json!(approval_policy));
    if let Some(sandbox) = &request.sandbox {
        params.insert("sandbox".into(), json!(sandbox));
    }
    if let Some(instructions) = &request.developer_instructions {
        params.insert("developerInstructions".into(), json!(instructions));
    }
    if let Some(model) = &request.model {
        params.insert("model".into(), json!(model));
    }
    params
}

#[async_trait]
impl AgentRun for AppServerSession {
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
        prefix: &str,
        decision: UserDecision,
    ) -> Result<(), SessionError> {
        let Some(correlation_id) = &request.correlation_id else {
            return Err(SessionError::Protocol(
                "approval request has no rpc id".into(),
            ));
        };
        let rpc_decision = RpcDecision::from_user(decision, request.kind, prefix);
        self.respond_approval(correlation_id, request.kind, rpc_decision)
            .await
    }

    async fn cancel(&self) {
        stop_process(self.handle.as_ref(), self.kill_grace).await;
        self.close();
    }

    fn close(&self) {
        self.shared.close();
    }
}

/// Starts [`AppServerSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppServerBackend;

#[async_trait]
impl AgentBackend for AppServerBackend {
    fn dialect(&self) -> BackendDialect {
        BackendDialect::AppServer
    }

    async fn start_run(
        &self,
        machine: Arc<dyn Machine>,
        request: StartRequest,
    ) -> Result<Arc<dyn AgentRun>, SessionError> {
        let workdir = resolve_workdir(machine.as_ref(), &request.workdir).await;
        let mut argv = vec![request.bin.clone(), "app-server".to_string()];
        argv.extend(request.args.iter().cloned());
        debug!(machine = machine.name(), ?argv, %workdir, "spawning app-server");

        let (sink, output) = output_channel();
        let handle = machine
            .run(RunRequest::new(argv).with_cwd(workdir.clone()), sink)
            .await?;
        let shared = Arc::new(Shared {
            rpc: JsonRpcConnection::new(handle.clone()),
            queue: EventQueue::new(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Starting,
                thread_id: None,
                turn_id: None,
            }),
        });
        let pump_task = tokio::spawn(pump(shared.clone(), output));
        tokio::spawn(reap(shared.clone(), handle.clone(), pump_task));

        let session = Arc::new(AppServerSession {
            run_id: RunId::generate(),
            handle,
            shared,
            kill_grace: request.kill_grace,
        });
        if let Err(err) = session.handshake(&request, &workdir).await {
            warn!(run_id = %session.run_id, error = %err, "app-server setup failed");
            session.cancel().await;
            return Err(err);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::testsupport::{AppServerScript, FakeMachine, FakeProgram};
    use crate::machine::MachineKind;

    fn start_request(thread_id: Option<&str>) -> StartRequest {
        StartRequest::from_config(&BackendConfig::default(), "hello", "/work", thread_id.map(ThreadId::new))
            .with_kill_grace(Duration::from_millis(50))
    }

    async fn drain(run: &dyn AgentRun) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), run.next_event())
            .await
            .expect("event stream stalled")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn start_performs_handshake_and_streams_until_completion() {
        let script = AppServerScript::new("t1").after_turn_start(vec![
            json!({"method":"turn/started","params":{"turn":{"id":"u1"}}}),
            json!({"method":"item/agentMessage/delta","params":{"delta":"Hel"}}),
            json!({"method":"item/agentMessage/delta","params":{"delta":"lo"}}),
            json!({"method":"turn/completed","params":{"turn":{"status":"completed"}}}),
        ]);
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .unwrap();

        let events = drain(run.as_ref()).await;
        let names: Vec<&str> = events.iter().map(AgentEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "thread_started",
                "turn_started",
                "agent_message_delta",
                "agent_message_delta",
                "turn_completed"
            ]
        );
        assert_eq!(run.thread_id(), Some(ThreadId::new("t1")));
        assert_eq!(run.phase(), SessionPhase::Completed);

        let runs = machine.runs();
        assert_eq!(runs[0].argv, vec!["codex".to_string(), "app-server".to_string()]);
        assert_eq!(runs[0].cwd.as_deref(), Some("/work"));

        let sent = machine.last_handle().written_json();
        let methods: Vec<&str> = sent.iter().filter_map(|m| m["method"].as_str()).collect();
        assert_eq!(methods, vec!["initialize", "thread/start", "turn/start"]);
        assert_eq!(sent[0]["params"]["clientInfo"]["name"], json!("agentrelay"));
        assert_eq!(sent[1]["params"]["approvalPolicy"], json!("on-request"));
        assert_eq!(sent[1]["params"]["cwd"], json!("/work"));
        assert_eq!(sent[2]["params"]["threadId"], json!("t1"));
        assert_eq!(sent[2]["params"]["input"][0], json!({"type":"text","text":"hello"}));
    }

    #[tokio::test]
    async fn resume_sends_thread_id() {
        let machine = Arc::new(FakeMachine::new(
            "local",
            MachineKind::Local,
            FakeProgram::AppServer(AppServerScript::new("t-old")),
        ));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(Some("t-old")))
            .await
            .unwrap();
        let sent = machine.last_handle().written_json();
        assert_eq!(sent[1]["method"], json!("thread/resume"));
        assert_eq!(sent[1]["params"]["threadId"], json!("t-old"));
        assert_eq!(run.thread_id(), Some(ThreadId::new("t-old")));
        run.cancel().await;
    }

    #[tokio::test]
    async fn approval_round_trip_uses_original_rpc_id() {
        let script = AppServerScript::new("t1")
            .after_turn_start(vec![json!({
                "id": "c1",
                "method": "item/commandExecution/requestApproval",
                "params": {"command": "git push origin main", "cwd": "/work"}
            })])
            .after_client_response(vec![json!({
                "method": "turn/completed",
                "params": {"turn": {"status": "completed"}}
            })]);
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .unwrap();

        assert_eq!(run.next_event().await.unwrap().name(), "thread_started");
        let Some(AgentEvent::ExecApprovalRequest { request }) = run.next_event().await else {
            panic!("expected approval request");
        };
        assert_eq!(run.phase(), SessionPhase::WaitingApproval);

        run.resolve_approval(&request, "git push", UserDecision::ApproveSimilar)
            .await
            .unwrap();
        let sent = machine.last_handle().written_json();
        assert_eq!(
            sent.last().unwrap(),
            &json!({"id":"c1","result":{"decision":{"acceptWithExecpolicyAmendment":{"execpolicy_amendment":["git","push"]}}}})
        );
        assert_eq!(drain(run.as_ref()).await.last().unwrap().name(), "turn_completed");
    }

    // Ensures an approval that lands before the handshake finishes keeps the
    // session waiting instead of flipping it back to active.
    #[tokio::test]
    async fn handshake_does_not_overwrite_waiting_approval() {
        let machine = FakeMachine::new("local", MachineKind::Local, FakeProgram::Silent);
        let (sink, _output) = output_channel();
        let handle = machine
            .run(RunRequest::new(vec!["codex".into()]), sink)
            .await
            .unwrap();
        let shared = Shared {
            rpc: JsonRpcConnection::new(handle),
            queue: EventQueue::new(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Starting,
                thread_id: None,
                turn_id: None,
            }),
        };
        shared.push(AgentEvent::ExecApprovalRequest {
            request: ApprovalRequest::new(ApprovalKind::CommandExecution, "git push"),
        });

        assert!(!shared.advance_phase(SessionPhase::Starting, SessionPhase::Active));
        assert_eq!(shared.state().phase, SessionPhase::WaitingApproval);
        assert!(shared.advance_phase(SessionPhase::WaitingApproval, SessionPhase::Active));
        assert_eq!(shared.state().phase, SessionPhase::Active);
    }

    #[tokio::test]
    async fn unknown_server_request_is_declined() {
        let script = AppServerScript::new("t1").after_turn_start(vec![
            json!({"id": 42, "method": "tool/mystery", "params": {}}),
            json!({"method":"turn/completed","params":{"turn":{"status":"completed"}}}),
        ]);
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .unwrap();
        drain(run.as_ref()).await;
        let sent = machine.last_handle().written_json();
        assert!(sent.contains(&json!({"id": 42, "result": {"decision": "decline"}})));
    }

    #[tokio::test]
    async fn amendment_for_file_change_is_rejected() {
        let machine = Arc::new(FakeMachine::new(
            "local",
            MachineKind::Local,
            FakeProgram::AppServer(AppServerScript::new("t1")),
        ));
        let backend = AppServerBackend;
        let run = backend.start_run(machine.clone(), start_request(None)).await.unwrap();
        let before = machine.last_handle().written_json().len();

        let mut request = ApprovalRequest::new(ApprovalKind::FileChange, "[file change approval]");
        request.correlation_id = Some(RequestId::Int(3));
        // ApproveSimilar on a file change maps to acceptForSession, never an amendment.
        run.resolve_approval(&request, "", UserDecision::ApproveSimilar).await.unwrap();
        let sent = machine.last_handle().written_json();
        assert_eq!(sent.len(), before + 1);
        assert_eq!(sent.last().unwrap(), &json!({"id":3,"result":{"decision":"acceptForSession"}}));
        run.cancel().await;
    }

    #[tokio::test]
    async fn process_exit_surfaces_error_and_closes() {
        let script = AppServerScript::new("t1").exit_after_turn_start(3);
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let run = AppServerBackend
            .start_run(machine, start_request(None))
            .await
            .unwrap();
        let events = drain(run.as_ref()).await;
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Error {
                message: "agent app-server exited with 3".into()
            })
        );
        assert!(run.phase().is_finished());
    }

    #[tokio::test]
    async fn approval_after_exit_reports_closed_session() {
        let script = AppServerScript::new("t1")
            .after_turn_start(vec![json!({
                "id": "c1",
                "method": "item/commandExecution/requestApproval",
                "params": {"command": "git push origin main", "cwd": "/work"}
            })])
            .exit_after_turn_start(1);
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .unwrap();
        let events = drain(run.as_ref()).await;
        let Some(AgentEvent::ExecApprovalRequest { request }) = events.get(1).cloned() else {
            panic!("expected approval request: {events:?}");
        };
        assert_eq!(run.phase(), SessionPhase::Closed);
        let before = machine.last_handle().written_json().len();

        let err = run
            .resolve_approval(&request, "git push", UserDecision::ApproveOnce)
            .await
            .unwrap_err();
        assert!(err.is_session_gone(), "{err}");
        assert_eq!(machine.last_handle().written_json().len(), before);
        assert_eq!(run.phase(), SessionPhase::Closed);
    }

    // Ensures a handshake failure tears the half-built session down.
    #[tokio::test]
    async fn setup_failure_cancels_process() {
        let script = AppServerScript::new("t1").fail_method("thread/start");
        let machine = Arc::new(FakeMachine::new("local", MachineKind::Local, FakeProgram::AppServer(script)));
        let err = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .err()
            .expect("setup must fail");
        assert!(err.to_string().contains("no such thread"), "{err}");
        assert!(machine.last_handle().was_terminated());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancel_stops_process() {
        let machine = Arc::new(FakeMachine::new(
            "local",
            MachineKind::Local,
            FakeProgram::AppServer(AppServerScript::new("t1")),
        ));
        let run = AppServerBackend
            .start_run(machine.clone(), start_request(None))
            .await
            .unwrap();
        run.close();
        run.close();
        run.cancel().await;
        let events = drain(run.as_ref()).await;
        assert_eq!(events.len(), 1, "only ThreadStarted precedes the sentinel: {events:?}");
        assert!(machine.last_handle().was_terminated());
        assert!(machine.last_handle().stdin_closed());
    }
}
