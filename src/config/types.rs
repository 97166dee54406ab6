//! Configuration data model.
//!
//! Every section deserializes with defaults so a partial (or empty) TOML
//! file yields a usable config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::defaults::*;
use crate::machine::MachineKind;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub approvals: ApprovalsConfig,
    pub liveness: LivenessConfig,
    pub output: OutputConfig,
    pub state: StateConfig,
    pub machines: MachinesConfig,
}

/// Which wire dialect the agent backend speaks.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendDialect {
    /// Long-lived `app-server` JSON-RPC process.
    #[default]
    AppServer,
    /// One `exec --json` process per turn (legacy streaming events).
    Exec,
}

/// `yolo` lets the agent act without protocol approvals at all.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    #[default]
    Guarded,
    Yolo,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub bin: String,
    /// Extra arguments passed after the subcommand.
    pub args: Vec<String>,
    pub dialect: BackendDialect,
    pub model: Option<String>,
    pub sandbox: Option<String>,
    pub reasoning_effort: Option<String>,
    /// One of `untrusted`, `on-request`, `on-failure`, `never`.
    pub approval_policy: String,
    pub approval_mode: ApprovalMode,
    pub skip_git_repo_check: bool,
    /// Where the backend writes its `*.jsonl` session logs.
    pub sessions_root: String,
    pub developer_instructions: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bin: DEFAULT_BACKEND_BIN.into(),
            args: Vec::new(),
            dialect: BackendDialect::default(),
            model: None,
            sandbox: None,
            reasoning_effort: None,
            approval_policy: DEFAULT_APPROVAL_POLICY.into(),
            approval_mode: ApprovalMode::default(),
            skip_git_repo_check: false,
            sessions_root: DEFAULT_SESSIONS_ROOT.into(),
            developer_instructions: Some(DEFAULT_DEVELOPER_INSTRUCTIONS.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// Leading shell words that form a trusted-prefix key.
    pub prefix_tokens: usize,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            prefix_tokens: DEFAULT_PREFIX_TOKENS,
        }
    }
}

/// Remote stall detection knobs (milliseconds).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LivenessConfig {
    pub first_event_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
    pub kill_grace_ms: u64,
}

impl LivenessConfig {
    pub fn first_event_timeout(&self) -> Duration {
        Duration::from_millis(self.first_event_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            first_event_timeout_ms: DEFAULT_FIRST_EVENT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            cancel_timeout_ms: DEFAULT_CANCEL_TIMEOUT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Forward backend log lines to the user.
    pub show_logs: bool,
    /// Forward tool starts and their final output to the user.
    pub show_tool_output: bool,
    pub show_reasoning: bool,
    pub max_tool_output_chars: usize,
    pub heartbeat_interval_ms: u64,
}

impl OutputConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            show_logs: false,
            show_tool_output: false,
            show_reasoning: false,
            max_tool_output_chars: DEFAULT_MAX_TOOL_OUTPUT_CHARS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// JSON state file. Unset means the platform data dir.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MachinesConfig {
    pub default: String,
    pub defs: BTreeMap<String, MachineDef>,
}

impl Default for MachinesConfig {
    fn default() -> Self {
        let mut defs = BTreeMap::new();
        defs.insert(DEFAULT_MACHINE_NAME.to_string(), MachineDef::default());
        Self {
            default: DEFAULT_MACHINE_NAME.into(),
            defs,
        }
    }
}

/// One execution target. The ssh fields are ignored for local machines.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MachineDef {
    #[serde(rename = "type")]
    pub kind: MachineKind,
    pub default_workdir: String,
    /// Roots `cd` may not escape. Empty means only `default_workdir`.
    pub allowed_roots: Vec<String>,
    /// Backend binary override for this machine.
    pub backend_bin: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub key_path: Option<String>,
    pub known_hosts: Option<String>,
    pub use_agent: bool,
    pub connect_timeout_secs: u64,
}

impl Default for MachineDef {
    fn default() -> Self {
        Self {
            kind: MachineKind::Local,
            default_workdir: ".".into(),
            allowed_roots: Vec::new(),
            backend_bin: None,
            host: None,
            user: None,
            port: DEFAULT_SSH_PORT,
            key_path: None,
            known_hosts: Some(DEFAULT_SSH_KNOWN_HOSTS.into()),
            use_agent: true,
            connect_timeout_secs: DEFAULT_SSH_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl MachineDef {
    /// Roots `cd` is confined to, falling back to the default workdir.
    pub fn effective_allowed_roots(&self) -> Vec<String> {
        if self.allowed_roots.is_empty() {
            vec![self.default_workdir.clone()]
        } else {
            self.allowed_roots.clone()
        }
    }
}
