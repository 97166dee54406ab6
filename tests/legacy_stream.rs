//! End-to-end turns through a real local process speaking the legacy
//! `exec --json` stream.
//!
//! The backend binary is a small shell script that ignores its arguments and
//! prints canned JSON lines, so these tests need `/bin/sh` but no agent.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agentrelay::config::{BackendDialect, Config, MachineDef};
use agentrelay::events::AgentEvent;
use agentrelay::ids::{ConversationId, RunId};
use agentrelay::machine::{LocalMachine, MachineRegistry};
use agentrelay::orchestrator::{Orchestrator, TurnObserver, TurnOutcome};
use agentrelay::session::ExecCliBackend;
use agentrelay::store::{MemoryStore, PendingAction, StateStore};
use async_trait::async_trait;

struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("agentrelay-it-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        Self(dir)
    }

    fn path(&self) -> &Path {
        &self.0
    }

    /// Write an executable `/bin/sh` script that prints `stdout` lines.
    fn backend_script(&self, stdout: &[&str], stderr: &[&str], exit_code: i32) -> String {
        let quote = |line: &str| format!("'{}'", line.replace('\'', r"'\''"));
        let mut script = String::from("#!/bin/sh\n");
        for line in stdout {
            script.push_str(&format!("printf '%s\\n' {}\n", quote(line)));
        }
        for line in stderr {
            script.push_str(&format!("printf '%s\\n' {} >&2\n", quote(line)));
        }
        script.push_str(&format!("exit {exit_code}\n"));

        let path = self.0.join("fake-agent");
        fs::write(&path, script).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path.to_string_lossy().to_string()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<AgentEvent>>,
    notices: Mutex<Vec<String>>,
}

#[async_trait]
impl TurnObserver for Recorder {
    async fn on_event(&self, event: &AgentEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    async fn on_notice(&self, text: &str) {
        self.notices.lock().unwrap().push(text.to_string());
    }

    async fn on_approval_required(&self, _run_id: &RunId, _pending: &PendingAction, _offer_similar: bool) {}
}

fn relay(bin: String, workdir: &Path, store: Arc<MemoryStore>) -> Orchestrator {
    let mut config = Config::default();
    config.backend.bin = bin;
    config.backend.dialect = BackendDialect::Exec;
    config.backend.approval_policy = "never".into();
    let mut registry = MachineRegistry::default();
    registry.insert(
        Arc::new(LocalMachine::new("local")),
        MachineDef {
            default_workdir: workdir.to_string_lossy().to_string(),
            ..MachineDef::default()
        },
    );
    Orchestrator::new(config, registry, Arc::new(ExecCliBackend), store)
}

#[tokio::test]
async fn local_exec_turn_records_thread_and_usage() {
    let dir = ScratchDir::new();
    let bin = dir.backend_script(
        &[
            r#"{"type":"thread.started","thread_id":"t-int"}"#,
            "not json at all",
            r#"{"type":"agent_message","message":"hello from the agent"}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":3,"output_tokens":4}}"#,
        ],
        &[],
        0,
    );
    let store = Arc::new(MemoryStore::new());
    let relay = relay(bin, dir.path(), store.clone());
    let observer = Arc::new(Recorder::default());
    let conversation = ConversationId::new("it-1");

    let outcome = relay
        .start_turn(&conversation, "say hello", observer.clone())
        .await
        .expect("turn");

    assert_eq!(outcome, TurnOutcome::Completed);
    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![AgentEvent::AgentMessage {
            text: "hello from the agent".into()
        }]
    );
    let state = store.get_conversation(&conversation).unwrap().unwrap();
    assert_eq!(state.thread_id.map(|t| t.to_string()).as_deref(), Some("t-int"));
    assert_eq!(state.thread_title.as_deref(), Some("say hello"));
    assert_eq!(state.last_input_tokens, Some(3));
    assert_eq!(state.last_output_tokens, Some(4));
    assert!(store.get_active_run(&conversation).unwrap().is_none());
}

#[tokio::test]
async fn nonzero_exit_fails_turn_with_log_details() {
    let dir = ScratchDir::new();
    let bin = dir.backend_script(&[], &["config error: bad profile"], 4);
    let relay = relay(bin, dir.path(), Arc::new(MemoryStore::new()));
    let observer = Arc::new(Recorder::default());

    let outcome = relay
        .start_turn(&ConversationId::new("it-2"), "hi", observer.clone())
        .await
        .expect("turn");

    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            message: "exited with 4".into()
        }
    );
    let notices = observer.notices.lock().unwrap().clone();
    assert_eq!(notices, vec!["Details:\nconfig error: bad profile".to_string()]);
}
