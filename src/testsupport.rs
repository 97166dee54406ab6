//! Shared test fixtures: temp dirs and a scripted in-memory machine.
//!
//! `FakeMachine` stands in for a local or remote host. Each `run` yields a
//! `FakeHandle` that records stdin and plays a [`FakeProgram`]: a scripted
//! app-server that answers the handshake, a fixed set of output lines, or a
//! process that never speaks (a stalled remote).

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

use crate::error::MachineError;
use crate::machine::{
    ExecResult, Machine, MachineKind, OutputChunk, OutputSink, RunHandle, RunRequest, StdStream,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("agentrelay-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.child(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Scripted programs
// ---------------------------------------------------------------------------

/// Scripted app-server peer.
#[derive(Debug, Clone, Default)]
pub struct AppServerScript {
    pub thread_id: String,
    /// Lines emitted right after answering `turn/start`.
    pub after_turn_start: Vec<Value>,
    /// Lines emitted after each response the client sends to a server request.
    pub after_client_response: Vec<Value>,
    /// Answer this method with an error.
    pub fail_method: Option<String>,
    /// Exit with this code right after answering `turn/start`.
    pub exit_after_turn_start: Option<i32>,
}

impl AppServerScript {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Self::default()
        }
    }

    pub fn after_turn_start(mut self, lines: Vec<Value>) -> Self {
        self.after_turn_start = lines;
        self
    }

    pub fn after_client_response(mut self, lines: Vec<Value>) -> Self {
        self.after_client_response = lines;
        self
    }

    pub fn fail_method(mut self, method: &str) -> Self {
        self.fail_method = Some(method.to_string());
        self
    }

    pub fn exit_after_turn_start(mut self, code: i32) -> Self {
        self.exit_after_turn_start = Some(code);
        self
    }

    /// Lines to emit for one client message, plus an optional exit code.
    fn reply(&self, message: &Value) -> (Vec<Value>, Option<i32>) {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return (self.after_client_response.clone(), None);
        };
        if self.fail_method.as_deref() == Some(method) {
            return (
                vec![json!({"id": id, "error": {"message": "no such thread"}})],
                None,
            );
        }
        match method {
            "initialize" => (vec![json!({"id": id, "result": {}})], None),
            "thread/start" => (
                vec![json!({"id": id, "result": {"thread": {"id": self.thread_id}}})],
                None,
            ),
            "thread/resume" => {
                let thread = message
                    .pointer("/params/threadId")
                    .cloned()
                    .unwrap_or_else(|| json!(self.thread_id));
                (vec![json!({"id": id, "result": {"thread": {"id": thread}}})], None)
            }
            "turn/start" => {
                let mut lines = vec![json!({"id": id, "result": {"turn": {"id": "turn-1"}}})];
                lines.extend(self.after_turn_start.iter().cloned());
                (lines, self.exit_after_turn_start)
            }
            _ => (vec![json!({"id": id, "result": {}})], None),
        }
    }
}

/// What a fake process does once spawned.
#[derive(Debug, Clone)]
pub enum FakeProgram {
    AppServer(AppServerScript),
    /// Emit these lines, then exit with `exit_code` (or run forever on `None`).
    Lines {
        stdout: Vec<String>,
        stderr: Vec<String>,
        exit_code: Option<i32>,
    },
    /// Never writes and never exits until signalled.
    Silent,
}

// ---------------------------------------------------------------------------
// FakeHandle
// ---------------------------------------------------------------------------

pub struct FakeHandle {
    written: Mutex<Vec<u8>>,
    write_notify: Notify,
    fail_writes: AtomicBool,
    terminated: AtomicBool,
    killed: AtomicBool,
    stdin_closed: AtomicBool,
    ignore_terminate: AtomicBool,
    exit: watch::Sender<Option<i32>>,
    sink: Mutex<Option<OutputSink>>,
    script: Option<AppServerScript>,
}

impl FakeHandle {
    /// A handle with no output side; only records stdin.
    pub fn new() -> Arc<Self> {
        Self::build(None, None)
    }

    fn build(sink: Option<OutputSink>, script: Option<AppServerScript>) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            write_notify: Notify::new(),
            fail_writes: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            stdin_closed: AtomicBool::new(false),
            ignore_terminate: AtomicBool::new(false),
            exit,
            sink: Mutex::new(sink),
            script,
        })
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }

    /// Every complete JSON line written to stdin so far.
    pub fn written_json(&self) -> Vec<Value> {
        let written = self.written.lock().unwrap();
        String::from_utf8_lossy(&written)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Wait until at least `count` JSON lines were written.
    pub async fn wait_for_writes(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.write_notify.notified();
                if self.written_json().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for stdin writes");
    }

    pub fn emit(&self, stream: StdStream, line: &str) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            let mut bytes = line.as_bytes().to_vec();
            bytes.push(b'\n');
            let _ = sink.send(OutputChunk { stream, bytes });
        }
    }

    /// Close the output side and report `code` to waiters.
    pub fn finish(&self, code: i32) {
        self.sink.lock().unwrap().take();
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(code);
                true
            } else {
                false
            }
        });
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl RunHandle for FakeHandle {
    async fn wait(&self) -> Result<i32, MachineError> {
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MachineError::CommandFailed("fake handle dropped".into()))?;
        Ok(code.unwrap_or_default())
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_terminate.load(Ordering::SeqCst) {
            self.finish(-15);
        }
    }

    async fn kill(&self) {
        if !self.has_exited() {
            self.killed.store(true, Ordering::SeqCst);
        }
        self.finish(-9);
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<(), MachineError> {
        if self.fail_writes.load(Ordering::SeqCst) || self.stdin_closed() {
            return Err(MachineError::StdinClosed);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        self.write_notify.notify_waiters();

        let Some(script) = &self.script else {
            return Ok(());
        };
        for line in String::from_utf8_lossy(data).lines() {
            let Ok(message) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let (replies, exit) = script.reply(&message);
            for reply in replies {
                self.emit(StdStream::Stdout, &reply.to_string());
            }
            if let Some(code) = exit {
                self.finish(code);
            }
        }
        Ok(())
    }

    async fn close_stdin(&self) {
        self.stdin_closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// FakeMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExec {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
}

pub struct FakeMachine {
    name: String,
    kind: MachineKind,
    default_program: FakeProgram,
    queued_programs: Mutex<VecDeque<FakeProgram>>,
    runs: Mutex<Vec<RecordedRun>>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    execs: Mutex<Vec<RecordedExec>>,
    exec_reply: Mutex<ExecResult>,
    reachable: AtomicBool,
    fail_spawn: AtomicBool,
    files: Mutex<HashMap<String, (String, i64)>>,
}

impl FakeMachine {
    pub fn new(name: &str, kind: MachineKind, program: FakeProgram) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default_program: program,
            queued_programs: Mutex::new(VecDeque::new()),
            runs: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            exec_reply: Mutex::new(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
            reachable: AtomicBool::new(true),
            fail_spawn: AtomicBool::new(false),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Play `program` for the next run instead of the default.
    pub fn queue_program(&self, program: FakeProgram) {
        self.queued_programs.lock().unwrap().push_back(program);
    }

    /// An unreachable machine hangs every `exec_capture` (including probes).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn set_exec_reply(&self, reply: ExecResult) {
        *self.exec_reply.lock().unwrap() = reply;
    }

    pub fn add_file(&self, path: &str, content: &str, mtime: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (content.to_string(), mtime));
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn execs(&self) -> Vec<RecordedExec> {
        self.execs.lock().unwrap().clone()
    }

    pub fn last_handle(&self) -> Arc<FakeHandle> {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no run was started")
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        self.kind
    }

    async fn run(
        &self,
        request: RunRequest,
        sink: OutputSink,
    ) -> Result<Arc<dyn RunHandle>, MachineError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(MachineError::CommandFailed("spawn refused".into()));
        }
        self.runs.lock().unwrap().push(RecordedRun {
            argv: request.argv.clone(),
            cwd: request.cwd.clone(),
        });
        let program = self
            .queued_programs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_program.clone());
        let handle = match program {
            FakeProgram::AppServer(script) => FakeHandle::build(Some(sink), Some(script)),
            FakeProgram::Silent => FakeHandle::build(Some(sink), None),
            FakeProgram::Lines {
                stdout,
                stderr,
                exit_code,
            } => {
                let handle = FakeHandle::build(Some(sink), None);
                for line in &stdout {
                    handle.emit(StdStream::Stdout, line);
                }
                for line in &stderr {
                    handle.emit(StdStream::Stderr, line);
                }
                if let Some(code) = exit_code {
                    handle.finish(code);
                }
                handle
            }
        };
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn exec_capture(
        &self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<ExecResult, MachineError> {
        self.execs.lock().unwrap().push(RecordedExec {
            argv: argv.to_vec(),
            cwd: cwd.map(str::to_string),
        });
        if !self.reachable.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.exec_reply.lock().unwrap().clone())
    }

    async fn read_text(&self, path: &str) -> Result<String, MachineError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| MachineError::CommandFailed(format!("no such file: {path}")))
    }

    async fn list_glob(&self, pattern: &str) -> Result<Vec<String>, MachineError> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| MachineError::CommandFailed(e.to_string()))?;
        let mut matches: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|path| pattern.matches(path))
            .cloned()
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn realpath(&self, path: &str) -> Result<String, MachineError> {
        Ok(crate::machine::paths::normalize_path(path))
    }

    async fn modified_unix(&self, path: &str) -> Result<i64, MachineError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(_, mtime)| *mtime)
            .ok_or_else(|| MachineError::CommandFailed(format!("no such file: {path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::output_channel;

    #[test]
    fn temp_dir_fixture_writes_and_cleans_up() {
        let path = {
            let dir = TestTempDir::new("fixture");
            let file = dir.write_text("a/b.txt", "hi");
            assert_eq!(fs::read_to_string(file).unwrap(), "hi");
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn scripted_app_server_answers_handshake() {
        let machine = FakeMachine::new(
            "m",
            MachineKind::Local,
            FakeProgram::AppServer(AppServerScript::new("t1")),
        );
        let (sink, mut output) = output_channel();
        let handle = machine
            .run(RunRequest::new(vec!["codex".into()]), sink)
            .await
            .unwrap();
        handle
            .write_stdin(b"{\"id\":1,\"method\":\"thread/start\",\"params\":{}}\n")
            .await
            .unwrap();
        let chunk = output.recv().await.unwrap();
        let reply: Value = serde_json::from_slice(&chunk.bytes).unwrap();
        assert_eq!(reply, json!({"id": 1, "result": {"thread": {"id": "t1"}}}));
    }

    #[tokio::test]
    async fn terminate_finishes_unless_ignored() {
        let handle = FakeHandle::new();
        handle.set_ignore_terminate(true);
        handle.terminate().await;
        assert!(handle.was_terminated());
        assert!(!handle.has_exited());
        handle.kill().await;
        assert!(handle.was_killed());
        assert_eq!(handle.wait().await.unwrap(), -9);
    }
}
