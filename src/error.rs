//! Unified error types for the relay.

use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// MachineError
// ---------------------------------------------------------------------------

/// Errors from spawning or talking to processes on a machine.
#[derive(Debug)]
pub enum MachineError {
    /// The program could not be started at all.
    Spawn { program: String, source: std::io::Error },
    /// Generic I/O failure on a pipe or file.
    Io(std::io::Error),
    /// Stdin was already closed (or never opened) when a write was attempted.
    StdinClosed,
    /// A helper command ran but reported failure.
    CommandFailed(String),
    /// A `cd` target resolved outside the configured allowed roots.
    CdNotAllowed(String),
    /// A bounded wait expired.
    Timeout(String),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "failed to spawn {program}: {source}"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::StdinClosed => write!(f, "stdin is closed"),
            Self::CommandFailed(msg) => write!(f, "command failed: {msg}"),
            Self::CdNotAllowed(path) => write!(f, "cd not allowed: {path}"),
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
        }
    }
}

impl std::error::Error for MachineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MachineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// Errors surfaced to callers awaiting a JSON-RPC response.
#[derive(Debug)]
pub enum RpcError {
    /// The connection was closed before (or while) the request was pending.
    Closed,
    /// The peer answered with an `error` payload.
    Remote(Value),
    /// Writing the request to the subprocess failed.
    Transport(MachineError),
    Encode(serde_json::Error),
}

impl RpcError {
    /// Best-effort human message extracted from a remote error payload.
    pub fn remote_message(&self) -> Option<String> {
        let Self::Remote(payload) = self else {
            return None;
        };
        payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(payload.to_string()))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Remote(_) => write!(
                f,
                "rpc error: {}",
                self.remote_message().unwrap_or_default()
            ),
            Self::Transport(e) => write!(f, "rpc transport: {e}"),
            Self::Encode(e) => write!(f, "rpc encode: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<MachineError> for RpcError {
    fn from(e: MachineError) -> Self {
        Self::Transport(e)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e)
    }
}

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Errors from starting or steering an agent session.
#[derive(Debug)]
pub enum SessionError {
    Machine(MachineError),
    Rpc(RpcError),
    /// The backend answered with something the session cannot use.
    Protocol(String),
    /// The requested decision does not apply to this approval.
    InvalidDecision(String),
    /// The session already closed.
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Machine(e) => write!(f, "{e}"),
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::InvalidDecision(msg) => write!(f, "invalid decision: {msg}"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl SessionError {
    /// The backend process or its pipe is gone, so nothing more can be sent.
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Machine(_) | Self::Rpc(RpcError::Closed | RpcError::Transport(_))
        )
    }
}

impl std::error::Error for SessionError {}

impl From<MachineError> for SessionError {
    fn from(e: MachineError) -> Self {
        Self::Machine(e)
    }
}

impl From<RpcError> for SessionError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from the conversation state store.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The store lock was poisoned by a panicking writer.
    Poisoned,
    /// The state file was written by an incompatible version.
    UnsupportedVersion(u32),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store io: {e}"),
            Self::Json(e) => write!(f, "store json: {e}"),
            Self::Poisoned => write!(f, "store lock poisoned"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported state file version {v}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// OrchestratorError (top level)
// ---------------------------------------------------------------------------

/// Errors returned by the public turn/approval operations.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Another turn is active for this conversation.
    RunInProgress,
    /// The decision targets a run that is no longer the active one.
    StaleApproval,
    /// The active run has nothing waiting on a decision.
    NoPendingApproval,
    /// The active-run row exists but its live session is gone (e.g. after restart).
    RunHandleMissing,
    UnknownMachine(String),
    /// A follow-up needs a thread, but the conversation has none yet.
    NoThread,
    InvalidPolicy(String),
    /// The run could not be started, even after failover.
    Start(String),
    Session(SessionError),
    Machine(MachineError),
    Store(StoreError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunInProgress => write!(f, "run in progress"),
            Self::StaleApproval => write!(f, "stale approval; no matching active run"),
            Self::NoPendingApproval => write!(f, "no pending approval"),
            Self::RunHandleMissing => {
                write!(f, "run is no longer attached; send a new message")
            }
            Self::UnknownMachine(name) => write!(f, "unknown machine `{name}`"),
            Self::NoThread => write!(f, "no thread to follow up on"),
            Self::InvalidPolicy(policy) => write!(f, "unknown approval policy `{policy}`"),
            Self::Start(msg) => write!(f, "failed to start run: {msg}"),
            Self::Session(e) => write!(f, "session: {e}"),
            Self::Machine(e) => write!(f, "machine: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<SessionError> for OrchestratorError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<MachineError> for OrchestratorError {
    fn from(e: MachineError) -> Self {
        Self::Machine(e)
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_remote_error_prefers_message_field() {
        let err = RpcError::Remote(json!({"code": -32600, "message": "bad thread"}));
        assert_eq!(err.to_string(), "rpc error: bad thread");
    }

    #[test]
    fn rpc_remote_error_falls_back_to_payload_json() {
        let err = RpcError::Remote(json!({"code": 1}));
        assert_eq!(err.to_string(), r#"rpc error: {"code":1}"#);
    }

    #[test]
    fn closed_connection_message_is_stable() {
        assert_eq!(RpcError::Closed.to_string(), "connection closed");
    }

    #[test]
    fn orchestrator_error_wraps_session_errors() {
        let err: OrchestratorError = SessionError::Rpc(RpcError::Closed).into();
        assert_eq!(err.to_string(), "session: connection closed");
    }

    #[test]
    fn config_error_display_variants() {
        let io = ConfigError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        assert!(io.to_string().contains("io: missing"));
        let invalid = ConfigError::Invalid("bad".into());
        assert_eq!(invalid.to_string(), "invalid config: bad");
    }
}
