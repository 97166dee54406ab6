//! Direct process spawning on this host.

use crate::error::MachineError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use super::process::{run_process, spawn_streaming};
use super::{ExecResult, Machine, MachineKind, OutputSink, RunHandle, RunRequest};

/// Runs processes on the local host, each in its own process group so
/// cancelling an agent also takes down the tools it spawned.
#[derive(Debug, Clone)]
pub struct LocalMachine {
    name: String,
}

impl LocalMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Expand a leading `~` against the local home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[async_trait]
impl Machine for LocalMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Local
    }

    async fn run(
        &self,
        request: RunRequest,
        sink: OutputSink,
    ) -> Result<Arc<dyn RunHandle>, MachineError> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(MachineError::CommandFailed("empty argv".into()));
        };
        let handle = spawn_streaming(
            program,
            args,
            request.cwd.as_deref(),
            &request.env,
            sink,
        )?;
        Ok(handle)
    }

    async fn exec_capture(
        &self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<ExecResult, MachineError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(MachineError::CommandFailed("empty argv".into()));
        };
        run_process(program, args, cwd).await
    }

    async fn read_text(&self, path: &str) -> Result<String, MachineError> {
        Ok(tokio::fs::read_to_string(expand_home(path)).await?)
    }

    async fn list_glob(&self, pattern: &str) -> Result<Vec<String>, MachineError> {
        let expanded = expand_home(pattern).to_string_lossy().to_string();
        tokio::task::spawn_blocking(move || {
            let paths = glob::glob(&expanded)
                .map_err(|e| MachineError::CommandFailed(format!("bad glob `{expanded}`: {e}")))?;
            let mut out: Vec<String> = paths
                .filter_map(Result::ok)
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            out.sort();
            Ok(out)
        })
        .await
        .map_err(|e| MachineError::Io(std::io::Error::other(e)))?
    }

    async fn realpath(&self, path: &str) -> Result<String, MachineError> {
        let resolved = tokio::fs::canonicalize(expand_home(path)).await?;
        Ok(resolved.to_string_lossy().to_string())
    }

    async fn modified_unix(&self, path: &str) -> Result<i64, MachineError> {
        let meta = tokio::fs::metadata(expand_home(path)).await?;
        let modified = meta.modified()?;
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}
