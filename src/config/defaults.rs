//! Built-in configuration defaults.

pub(super) const DEFAULT_BACKEND_BIN: &str = "codex";
pub(super) const DEFAULT_APPROVAL_POLICY: &str = "untrusted";
pub(super) const DEFAULT_SESSIONS_ROOT: &str = "~/.codex/sessions";
pub(super) const DEFAULT_MACHINE_NAME: &str = "local";
pub(super) const DEFAULT_PREFIX_TOKENS: usize = 2;

pub(super) const DEFAULT_FIRST_EVENT_TIMEOUT_MS: u64 = 15_000;
pub(super) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub(super) const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub(super) const DEFAULT_CANCEL_TIMEOUT_MS: u64 = 5_000;
pub(super) const DEFAULT_KILL_GRACE_MS: u64 = 2_000;

pub(super) const DEFAULT_MAX_TOOL_OUTPUT_CHARS: usize = 1_200;
pub(super) const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 4_000;

pub(super) const DEFAULT_SSH_PORT: u16 = 22;
pub(super) const DEFAULT_SSH_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";
pub(super) const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Appended to the thread's developer instructions so the agent asks for
/// approval through the protocol instead of in prose.
pub(super) const DEFAULT_DEVELOPER_INSTRUCTIONS: &str = "Approvals are handled by the relay. \
When an action needs approval, request it through the approval protocol and wait; \
do not ask the user to approve in chat text.";

/// Approval policies the backend understands.
pub const KNOWN_APPROVAL_POLICIES: &[&str] = &["untrusted", "on-request", "on-failure", "never"];
