//! Remote-shell machine over the system `ssh` client.
//!
//! All processes share one multiplexed control connection so liveness probes
//! and helper commands stay cheap. Remote shells have no native cwd or env
//! parameters, so both are emulated in the command line.

use crate::error::MachineError;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
#[cfg(test)]
use std::sync::{Mutex as StdMutex, OnceLock};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::process::{ensure_success, run_process, shell_quote, spawn_streaming};
use super::{ExecResult, Machine, MachineKind, OutputSink, RunHandle, RunRequest};

const GLOB_HELPER: &str = "import glob, os, sys; \
pat=os.path.expanduser(sys.argv[1]); \
print('\\n'.join(sorted(glob.glob(pat, recursive=True))))";

const REALPATH_HELPER: &str = "import os, sys; \
print(os.path.realpath(os.path.expanduser(sys.argv[1])))";

/// Connection settings for one ssh target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<String>,
    pub known_hosts: Option<String>,
    pub use_agent: bool,
    pub connect_timeout_secs: u64,
}

impl SshOptions {
    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

pub struct SshMachine {
    name: String,
    options: SshOptions,
    control_path: PathBuf,
}

impl SshMachine {
    pub fn new(name: impl Into<String>, options: SshOptions) -> Self {
        let control_path = build_ssh_control_path(&options.target());
        Self {
            name: name.into(),
            options,
            control_path,
        }
    }

    /// Arguments shared by every ssh invocation, up to and including the target.
    fn ssh_args(&self) -> Vec<String> {
        let opts = &self.options;
        let mut args: Vec<String> = vec![
            "-T".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "ControlPersist=300".into(),
            "-o".into(),
            format!("ConnectTimeout={}", opts.connect_timeout_secs.max(1)),
            "-p".into(),
            opts.port.to_string(),
        ];
        if let Some(key) = &opts.key_path {
            args.push("-i".into());
            args.push(super::local::expand_home(key).display().to_string());
        }
        if let Some(known_hosts) = &opts.known_hosts {
            args.push("-o".into());
            args.push(format!(
                "UserKnownHostsFile={}",
                super::local::expand_home(known_hosts).display()
            ));
        }
        if !opts.use_agent {
            args.push("-o".into());
            args.push("IdentityAgent=none".into());
        }
        args.push(opts.target());
        args
    }
}

/// Build the remote shell line for `argv`, emulating `cwd` and `env`.
///
/// An absolute program path also puts its directory on `PATH`: shebang
/// scripts like `#!/usr/bin/env node` otherwise miss sibling interpreters in
/// non-interactive sessions.
pub fn remote_command_line(argv: &[String], cwd: Option<&str>, env: &[(String, String)]) -> String {
    let mut cmd = argv
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    if !env.is_empty() {
        let exports = env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        cmd = format!("env {exports} {cmd}");
    }
    if let Some(dir) = cwd.filter(|d| !d.is_empty()) {
        cmd = format!("cd {} && {cmd}", quote_remote_path(dir));
    }
    if let Some(program) = argv.first() {
        if program.starts_with('/') {
            if let Some(bindir) = Path::new(program).parent() {
                let bindir = bindir.to_string_lossy();
                cmd = format!("PATH={}:$PATH; export PATH; {cmd}", shell_quote(&bindir));
            }
        }
    }
    cmd
}

/// Quote a path but leave a leading `~/` for the remote shell to expand.
fn quote_remote_path(path: &str) -> String {
    if path == "~" {
        return "~".into();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

#[async_trait]
impl Machine for SshMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Ssh
    }

    async fn run(
        &self,
        request: RunRequest,
        sink: OutputSink,
    ) -> Result<Arc<dyn RunHandle>, MachineError> {
        if request.argv.is_empty() {
            return Err(MachineError::CommandFailed("empty argv".into()));
        }
        let mut args = self.ssh_args();
        args.push(remote_command_line(
            &request.argv,
            request.cwd.as_deref(),
            &request.env,
        ));
        let handle = spawn_streaming("ssh", &args, None, &[], sink)?;
        Ok(handle)
    }

    async fn exec_capture(
        &self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<ExecResult, MachineError> {
        let mut args = self.ssh_args();
        args.push(remote_command_line(argv, cwd, &[]));
        run_process("ssh", &args, None).await
    }

    async fn read_text(&self, path: &str) -> Result<String, MachineError> {
        let argv = ["cat".to_string(), "--".to_string(), path.to_string()];
        let out = self.exec_capture(&argv, None).await?;
        Ok(ensure_success(out, &format!("failed to read {path}"))?.stdout)
    }

    async fn list_glob(&self, pattern: &str) -> Result<Vec<String>, MachineError> {
        let argv = [
            "python3".to_string(),
            "-c".to_string(),
            GLOB_HELPER.to_string(),
            pattern.to_string(),
        ];
        let out = self.exec_capture(&argv, None).await?;
        if out.exit_code != 0 {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn realpath(&self, path: &str) -> Result<String, MachineError> {
        let argv = [
            "python3".to_string(),
            "-c".to_string(),
            REALPATH_HELPER.to_string(),
            path.to_string(),
        ];
        let out = self.exec_capture(&argv, None).await?;
        Ok(ensure_success(out, "realpath failed")?.stdout.trim().to_string())
    }

    async fn modified_unix(&self, path: &str) -> Result<i64, MachineError> {
        let argv = [
            "stat".to_string(),
            "-c".to_string(),
            "%Y".to_string(),
            path.to_string(),
        ];
        let out = ensure_success(self.exec_capture(&argv, None).await?, "stat failed")?;
        out.stdout
            .trim()
            .parse::<i64>()
            .map_err(|e| MachineError::CommandFailed(format!("bad mtime for {path}: {e}")))
    }
}

impl Drop for SshMachine {
    fn drop(&mut self) {
        // Best-effort connection cleanup; failures are non-fatal.
        close_ssh_control_connection(&self.options.target(), &self.control_path);
    }
}

#[cfg(test)]
type SshCloseHook = Box<dyn Fn(&str, &Path) + Send + Sync + 'static>;

#[cfg(test)]
fn ssh_close_hook_slot() -> &'static StdMutex<Option<SshCloseHook>> {
    static SLOT: OnceLock<StdMutex<Option<SshCloseHook>>> = OnceLock::new();
    SLOT.get_or_init(|| StdMutex::new(None))
}

#[cfg(test)]
fn set_ssh_close_hook_for_tests(hook: Option<SshCloseHook>) {
    *ssh_close_hook_slot().lock().expect("ssh close hook lock") = hook;
}

fn close_ssh_control_connection(target: &str, control_path: &Path) {
    #[cfg(test)]
    {
        if let Some(hook) = ssh_close_hook_slot()
            .lock()
            .expect("ssh close hook lock")
            .as_ref()
        {
            hook(target, control_path);
            return;
        }
    }

    if !control_path.exists() {
        return;
    }
    let _ = std::process::Command::new("ssh")
        .arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("exit")
        .arg(target)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let _ = std::fs::remove_file(control_path);
}

fn build_ssh_control_path(target: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let hash = hasher.finish();
    std::env::temp_dir().join(format!("agentrelay-ssh-{hash:x}.sock"))
}
