//! Process/transport abstraction.
//!
//! A [`Machine`] spawns long-lived subprocesses and one-shot helper commands
//! either on this host or over a remote shell. Everything above this layer is
//! transport-agnostic: it sees raw byte chunks on an [`OutputSink`] and a
//! [`RunHandle`] for lifecycle control.

use crate::error::MachineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod local;
pub mod paths;
pub(crate) mod process;
pub mod registry;
pub mod ssh;

pub use local::LocalMachine;
pub use registry::{MachineEntry, MachineRegistry};
pub use ssh::SshMachine;

/// Transport family of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    #[default]
    Local,
    Ssh,
}

impl MachineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
        }
    }
}

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// One raw read from a child pipe (at most 4096 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StdStream,
    pub bytes: Vec<u8>,
}

/// Receiver side of a run's output.
pub type OutputStream = mpsc::UnboundedReceiver<OutputChunk>;

/// Sender side handed to [`Machine::run`]. All clones are dropped once both
/// pipes reach EOF, so the paired [`OutputStream`] ends.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

/// Create a connected sink/stream pair.
pub fn output_channel() -> (OutputSink, OutputStream) {
    mpsc::unbounded_channel()
}

/// What to run and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

impl RunRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Output of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Lifecycle control for one spawned process.
///
/// `terminate`, `kill` and `close_stdin` are advisory and never fail: the
/// process may already be gone, or the remote link may be dead.
#[async_trait]
pub trait RunHandle: Send + Sync {
    /// Wait for exit. Resolves only after both output pipes were drained.
    /// Signal deaths are reported as `-signal`.
    async fn wait(&self) -> Result<i32, MachineError>;
    async fn terminate(&self);
    async fn kill(&self);
    async fn write_stdin(&self, data: &[u8]) -> Result<(), MachineError>;
    async fn close_stdin(&self);
}

#[async_trait]
pub trait Machine: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> MachineKind;

    /// Spawn a streaming process; output chunks go to `sink`.
    async fn run(
        &self,
        request: RunRequest,
        sink: OutputSink,
    ) -> Result<Arc<dyn RunHandle>, MachineError>;

    /// Run a command to completion and capture its decoded output.
    async fn exec_capture(
        &self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<ExecResult, MachineError>;

    async fn read_text(&self, path: &str) -> Result<String, MachineError>;

    /// Recursive (`**`) glob, sorted, with `~` expanded on the machine itself.
    async fn list_glob(&self, pattern: &str) -> Result<Vec<String>, MachineError>;

    /// Resolve `~` and symlinks on the machine itself.
    async fn realpath(&self, path: &str) -> Result<String, MachineError>;

    /// Modification time in unix seconds.
    async fn modified_unix(&self, path: &str) -> Result<i64, MachineError>;
}

/// Cheap liveness check: run `true` on the machine.
pub async fn probe(machine: &dyn Machine) -> Result<(), MachineError> {
    let result = machine.exec_capture(&["true".to_string()], None).await?;
    if result.exit_code == 0 {
        Ok(())
    } else {
        Err(MachineError::CommandFailed(format!(
            "probe exited with {}",
            result.exit_code
        )))
    }
}
