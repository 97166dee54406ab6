//! Process spawning helpers shared by the local and ssh machines.

use crate::error::MachineError;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};

use super::{ExecResult, OutputChunk, OutputSink, RunHandle, StdStream};

const PUMP_CHUNK_BYTES: usize = 4096;

/// Spawn and wait for a process, capturing decoded output.
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    cwd: Option<&str>,
) -> Result<ExecResult, MachineError> {
    let mut cmd = Command::new(program);
    // Probe timeouts drop this future; take the child down with it.
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|source| MachineError::Spawn {
        program: program.to_string(),
        source,
    })?;

    Ok(ExecResult {
        exit_code: exit_code_of(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Convert non-zero command status into contextual errors.
pub(crate) fn ensure_success(output: ExecResult, context: &str) -> Result<ExecResult, MachineError> {
    if output.exit_code == 0 {
        return Ok(output);
    }

    let mut details = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    if details.is_empty() {
        details = format!("command exited with {}", output.exit_code);
    }

    Err(MachineError::CommandFailed(format!("{context}: {details}")))
}

/// Exit code with signal deaths mapped to `-signal`.
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Human-oriented duration formatting used in timeout messages.
pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 {
        return format!("{millis}ms");
    }
    if millis == 0 {
        if secs % 60 == 0 {
            return format!("{}m", secs / 60);
        }
        return format!("{secs}s");
    }
    format!("{secs}.{millis:03}s")
}

/// POSIX quoting for remote command lines.
///
/// Plain words pass through untouched so remote command lines stay readable
/// in logs.
pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-/:=@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Spawn `program` with piped stdio and stream its output into `sink`.
///
/// The child leads a fresh process group so signals reach its descendants.
pub(crate) fn spawn_streaming(
    program: &str,
    args: &[String],
    cwd: Option<&str>,
    env: &[(String, String)],
    sink: OutputSink,
) -> Result<Arc<ChildRunHandle>, MachineError> {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| MachineError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();
    debug!(program, ?pid, "spawned process");

    let stdin = child.stdin.take();
    let stdout_pump = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, StdStream::Stdout, sink.clone())));
    let stderr_pump = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, StdStream::Stderr, sink.clone())));
    drop(sink);

    let (exit_tx, exit_rx) = watch::channel::<Option<Result<i32, String>>>(None);
    let label = program.to_string();
    tokio::spawn(async move {
        let status = child.wait().await;
        for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
            let _ = pump.await;
        }
        let outcome = match status {
            Ok(status) => Ok(exit_code_of(status)),
            Err(e) => {
                warn!(program = %label, error = %e, "waiting on process failed");
                Err(e.to_string())
            }
        };
        let _ = exit_tx.send(Some(outcome));
    });

    Ok(Arc::new(ChildRunHandle {
        program: program.to_string(),
        pid,
        stdin: Mutex::new(stdin),
        exit: exit_rx,
    }))
}

async fn pump<R>(mut reader: R, stream: StdStream, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PUMP_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                // Keep draining after the receiver is gone so the child never
                // blocks on a full pipe.
                let _ = sink.send(chunk);
            }
        }
    }
}

/// Handle over a locally spawned child (the local agent or the ssh client).
pub(crate) struct ChildRunHandle {
    program: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    exit: watch::Receiver<Option<Result<i32, String>>>,
}

impl ChildRunHandle {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn signal(&self, sig: i32) {
        if self.has_exited() {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        send_signal(pid, sig);
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pid, sig) } == 0 {
        return;
    }
    // SAFETY: as above.
    unsafe {
        libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _sig: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[async_trait]
impl RunHandle for ChildRunHandle {
    async fn wait(&self) -> Result<i32, MachineError> {
        let mut rx = self.exit.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                MachineError::Io(std::io::Error::other(format!(
                    "{}: process waiter vanished",
                    self.program
                )))
            })?
            .clone();
        match outcome {
            Some(Ok(code)) => Ok(code),
            Some(Err(msg)) => Err(MachineError::Io(std::io::Error::other(msg))),
            None => Err(MachineError::Io(std::io::Error::other("exit state missing"))),
        }
    }

    async fn terminate(&self) {
        self.signal(SIGTERM);
    }

    async fn kill(&self) {
        self.signal(SIGKILL);
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<(), MachineError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(MachineError::StdinClosed)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close_stdin(&self) {
        let mut guard = self.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }
}
