//! Internal event algebra shared by every backend dialect.
//!
//! Wire dialects map into [`AgentEvent`] through explicit rules in
//! [`normalize`] (legacy streaming JSON) and [`app_server`] (RPC
//! notifications and server requests). New wire shapes need a new rule;
//! nothing maps implicitly.

use crate::ids::{RequestId, ThreadId, TurnId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod app_server;
pub mod normalize;

pub use normalize::{parse_event_obj, parse_json_line};

/// What an approval request asks permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// RPC `item/commandExecution/requestApproval`.
    CommandExecution,
    /// RPC `item/fileChange/requestApproval`.
    FileChange,
    /// Legacy streaming `exec_approval_request` and escalated tool calls.
    LegacyExec,
}

/// Placeholder command shown for file-change approvals.
pub const FILE_CHANGE_COMMAND: &str = "[file change approval]";

/// One request for a human decision, as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub kind: ApprovalKind,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_argv: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RPC id (RPC dialect) or `call_id` (legacy) the decision must address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<RequestId>,
    /// Id of a `{id, msg}` envelope the request arrived in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_id: Option<String>,
}

impl ApprovalRequest {
    pub fn new(kind: ApprovalKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            command_argv: None,
            cwd: None,
            reason: None,
            correlation_id: None,
            outer_id: None,
        }
    }
}

/// Usage reported when a legacy turn completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
}

/// One rate-limit window; each field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub used_percent: Option<f64>,
    pub window_minutes: Option<i64>,
    /// Unix seconds.
    pub resets_at: Option<i64>,
}

impl RateLimitWindow {
    pub fn is_empty(&self) -> bool {
        self.used_percent.is_none() && self.window_minutes.is_none() && self.resets_at.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub primary: Option<RateLimitWindow>,
    pub secondary: Option<RateLimitWindow>,
}

/// Token and rate-limit telemetry.
///
/// Token counts describe the most recent request (current context
/// occupancy) whenever the wire offers that breakdown, not cumulative usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSnapshot {
    pub model_context_window: Option<i64>,
    pub total_tokens: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub reasoning_output_tokens: Option<i64>,
    pub rate_limits: RateLimits,
}

impl TokenUsageSnapshot {
    /// `model_context_window - total_tokens`, clamped at zero.
    pub fn context_remaining(&self) -> Option<i64> {
        let window = self.model_context_window?;
        let used = self.total_tokens?;
        Some(window.saturating_sub(used).max(0))
    }

    pub fn has_token_counts(&self) -> bool {
        self.model_context_window.is_some() || self.total_tokens.is_some()
    }
}

/// The closed set of events the rest of the relay consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ThreadStarted { thread_id: ThreadId },
    TurnStarted { turn_id: Option<TurnId> },
    TurnCompleted { usage: Option<TurnUsage> },
    TurnFailed { message: String },
    AgentMessageDelta { text: String },
    /// Final assistant message.
    AgentMessage { text: String },
    ReasoningDelta { text: String },
    TokenUsage { usage: TokenUsageSnapshot },
    ExecApprovalRequest { request: ApprovalRequest },
    ToolStarted { command: String },
    ExecOutputDelta { text: String },
    ExecEnd {
        exit_code: Option<i32>,
        aggregated_output: Option<String>,
    },
    LogLine { text: String },
    Error { message: String },
}

impl AgentEvent {
    /// Turn-ending protocol events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnCompleted { .. } | Self::TurnFailed { .. })
    }

    /// Short event name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ThreadStarted { .. } => "thread_started",
            Self::TurnStarted { .. } => "turn_started",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::TurnFailed { .. } => "turn_failed",
            Self::AgentMessageDelta { .. } => "agent_message_delta",
            Self::AgentMessage { .. } => "agent_message",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::TokenUsage { .. } => "token_usage",
            Self::ExecApprovalRequest { .. } => "exec_approval_request",
            Self::ToolStarted { .. } => "tool_started",
            Self::ExecOutputDelta { .. } => "exec_output_delta",
            Self::ExecEnd { .. } => "exec_end",
            Self::LogLine { .. } => "log_line",
            Self::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Field helpers shared by both dialect mappers
// ---------------------------------------------------------------------------

/// First non-empty string among `keys`.
pub(crate) fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// String field, if present and a string (may be empty).
pub(crate) fn opt_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Integer field. Booleans and floats never count as integers.
pub(crate) fn opt_int(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

/// Numeric field (integer or float), excluding booleans.
pub(crate) fn opt_number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

pub(crate) fn opt_object<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// Exit codes outside the `i32` range are treated as unknown.
pub(crate) fn opt_exit_code(obj: &Map<String, Value>, key: &str) -> Option<i32> {
    opt_int(obj, key).and_then(|code| i32::try_from(code).ok())
}
